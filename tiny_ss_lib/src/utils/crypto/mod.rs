/**********************************************************************

Copyright (C) 2021 by reddal

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU General Public License for more details.

You should have received a copy of the GNU General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.

**********************************************************************/

pub mod aead;
pub mod stream;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("invalid key length {0}")]
	InvalidKeyLength(usize),
	#[error("invalid nonce length {0}")]
	InvalidNonceLength(usize),
	#[error("AEAD tag mismatch")]
	Authentication,
	#[error("cannot seal {0} bytes")]
	Seal(usize),
}

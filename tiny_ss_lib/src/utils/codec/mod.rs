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

/*!
Chunked AEAD stream codec.

A plain byte stream is cut into chunks of at most [`MAX_PACKET_SIZE`] bytes.
Each chunk is sent as:
```not_rust
+------------------+------------+-------------+----------+
|    encrypted     |    length  |  encrypted  |  payload |
|  payload length  |     tag    |   payload   |    tag   |
+------------------+------------+-------------+----------+
|     2 bytes      |  16 bytes  |  n bytes    | 16 bytes |
+------------------+------------+-------------+----------+
```

Length and payload are sealed separately, each with its own nonce.
Nonce starts from all zeros and is increased by one (little-endian) after
every seal/open, so sender and receiver must stay in lock-step.
*/

mod read;
mod write;

pub use read::Reader;
pub use write::Writer;

use super::crypto::{self, aead::TAG_LEN};
use std::io;

/// Max payload size of a single chunk.
///
/// The top two bits of the length field are reserved and always zero.
pub const MAX_PACKET_SIZE: usize = 16 * 1024 - 1;
pub const PACKET_LENGTH_BUFFER_SIZE: usize = 2;
pub const OVERHEAD: usize = TAG_LEN;
/// Size of an encrypted length field, tag included.
pub const LENGTH_CHUNK_SIZE: usize = PACKET_LENGTH_BUFFER_SIZE + OVERHEAD;

#[allow(clippy::cast_possible_truncation)]
const LENGTH_MASK: u16 = MAX_PACKET_SIZE as u16;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("chunk length cannot be zero")]
	EmptyChunk,
	#[error("chunk length {len} exceeds max packet size {max}")]
	ChunkTooLarge { len: usize, max: usize },
	#[error("invalid encrypted chunk of {0} bytes")]
	InvalidChunk(usize),
	#[error("chunk authentication failed")]
	Authentication,
	#[error("{0}")]
	Crypto(crypto::Error),
}

impl Error {
	/// Returns the codec error carried by `e`, if any.
	#[must_use]
	pub fn from_io(e: &io::Error) -> Option<&Self> {
		e.get_ref()?.downcast_ref()
	}

	#[inline]
	#[must_use]
	pub fn is_authentication(&self) -> bool {
		matches!(self, Self::Authentication)
	}
}

impl From<crypto::Error> for Error {
	fn from(e: crypto::Error) -> Self {
		match e {
			crypto::Error::Authentication => Self::Authentication,
			e => Self::Crypto(e),
		}
	}
}

impl From<Error> for io::Error {
	#[inline]
	fn from(e: Error) -> Self {
		io::Error::new(io::ErrorKind::InvalidData, e)
	}
}

/// State of a single direction of the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
	Active,
	/// An IO, framing or authentication error occurred.
	/// Nothing will be read or written anymore.
	Faulted,
	/// EOF was reached (reader) or shutdown was called (writer).
	Closed,
}

fn faulted_err(name: &str) -> io::Error {
	io::Error::new(
		io::ErrorKind::BrokenPipe,
		format!("{} is faulted and cannot be used anymore", name),
	)
}

#[cfg(test)]
pub(crate) mod test_utils {
	use super::{MAX_PACKET_SIZE, Reader, Writer};
	use crate::utils::crypto::aead::{Algorithm, Cipher};
	use rand::{rngs::OsRng, RngCore};

	pub fn new_test_cipher() -> Cipher {
		let mut key = [0_u8; 16];
		OsRng.fill_bytes(&mut key);
		Cipher::new(Algorithm::Aes128Gcm, &key).unwrap()
	}

	/// Encode `plain` with a fresh writer and return the wire bytes.
	pub fn encode(cipher: &Cipher, plain: &[u8]) -> Vec<u8> {
		let rt = tokio::runtime::Runtime::new().unwrap();
		rt.block_on(async {
			let mut writer = Writer::new(Vec::new(), cipher.clone(), MAX_PACKET_SIZE);
			let n = writer.write(plain).await.unwrap();
			assert_eq!(n, plain.len());
			writer.into_inner()
		})
	}

	pub fn new_reader<'a>(cipher: &Cipher, data: &'a [u8]) -> Reader<&'a [u8]> {
		Reader::new(data, cipher.clone(), MAX_PACKET_SIZE)
	}
}

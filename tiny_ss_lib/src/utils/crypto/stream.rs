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
Unauthenticated stream ciphers used by the legacy shadowsocks methods.

They provide no integrity at all, a flipped bit in the cipher text
becomes a flipped bit in the plain text.
*/

use super::Error;
use aes::{Aes128, Aes192, Aes256};
use chacha20::{ChaCha20, XChaCha20};
use ctr::{
	cipher::{KeyInit, KeyIvInit, StreamCipher},
	Ctr128BE,
};
use md5::{Digest, Md5};
use rc4::{consts::U16, Rc4};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Algorithm {
	Aes128Ctr,
	Aes192Ctr,
	Aes256Ctr,
	Rc4Md5,
	ChaCha20Ietf,
	XChaCha20,
}

impl Algorithm {
	#[inline]
	#[must_use]
	pub fn key_size(self) -> usize {
		match self {
			Self::Aes128Ctr | Self::Rc4Md5 => 16,
			Self::Aes192Ctr => 24,
			Self::Aes256Ctr | Self::ChaCha20Ietf | Self::XChaCha20 => 32,
		}
	}

	/// Length of the IV sent in front of the stream.
	#[inline]
	#[must_use]
	pub fn iv_size(self) -> usize {
		match self {
			Self::Aes128Ctr | Self::Aes192Ctr | Self::Aes256Ctr | Self::Rc4Md5 => 16,
			Self::ChaCha20Ietf => 12,
			Self::XChaCha20 => 24,
		}
	}
}

pub enum Cipher {
	Aes128Ctr(Ctr128BE<Aes128>),
	Aes192Ctr(Ctr128BE<Aes192>),
	Aes256Ctr(Ctr128BE<Aes256>),
	Rc4(Rc4<U16>),
	ChaCha20(ChaCha20),
	XChaCha20(XChaCha20),
}

impl Cipher {
	/// Creates a keystream of `algo` from `key` and `iv`.
	///
	/// For [`Algorithm::Rc4Md5`] the RC4 key is `MD5(key | iv)`.
	///
	/// # Errors
	///
	/// Returns an error if `key` or `iv` has the wrong length.
	pub fn new(algo: Algorithm, key: &[u8], iv: &[u8]) -> Result<Self, Error> {
		if key.len() != algo.key_size() {
			return Err(Error::InvalidKeyLength(key.len()));
		}
		if iv.len() != algo.iv_size() {
			return Err(Error::InvalidNonceLength(iv.len()));
		}
		let invalid = |_| Error::InvalidKeyLength(key.len());
		Ok(match algo {
			Algorithm::Aes128Ctr => {
				Self::Aes128Ctr(Ctr128BE::new_from_slices(key, iv).map_err(invalid)?)
			}
			Algorithm::Aes192Ctr => {
				Self::Aes192Ctr(Ctr128BE::new_from_slices(key, iv).map_err(invalid)?)
			}
			Algorithm::Aes256Ctr => {
				Self::Aes256Ctr(Ctr128BE::new_from_slices(key, iv).map_err(invalid)?)
			}
			Algorithm::Rc4Md5 => {
				let mut d = Md5::new();
				d.update(key);
				d.update(iv);
				let rc4_key = d.finalize();
				Self::Rc4(Rc4::new_from_slice(&rc4_key).map_err(invalid)?)
			}
			Algorithm::ChaCha20Ietf => {
				Self::ChaCha20(ChaCha20::new_from_slices(key, iv).map_err(invalid)?)
			}
			Algorithm::XChaCha20 => {
				Self::XChaCha20(XChaCha20::new_from_slices(key, iv).map_err(invalid)?)
			}
		})
	}

	/// XOR `buf` with the next `buf.len()` bytes of keystream.
	pub fn apply_keystream(&mut self, buf: &mut [u8]) {
		match self {
			Self::Aes128Ctr(c) => c.apply_keystream(buf),
			Self::Aes192Ctr(c) => c.apply_keystream(buf),
			Self::Aes256Ctr(c) => c.apply_keystream(buf),
			Self::Rc4(c) => c.apply_keystream(buf),
			Self::ChaCha20(c) => c.apply_keystream(buf),
			Self::XChaCha20(c) => c.apply_keystream(buf),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const ALGOS: [Algorithm; 6] = [
		Algorithm::Aes128Ctr,
		Algorithm::Aes192Ctr,
		Algorithm::Aes256Ctr,
		Algorithm::Rc4Md5,
		Algorithm::ChaCha20Ietf,
		Algorithm::XChaCha20,
	];

	#[test]
	fn test_keystream_split_writes() {
		// Applying the keystream in pieces must equal applying it at once.
		let plain: Vec<u8> = (0..=255_u8).cycle().take(1000).collect();
		for algo in &ALGOS {
			let key = vec![3_u8; algo.key_size()];
			let iv = vec![9_u8; algo.iv_size()];

			let mut whole = plain.clone();
			Cipher::new(*algo, &key, &iv)
				.unwrap()
				.apply_keystream(&mut whole);
			assert_ne!(whole, plain, "{:?} keystream is empty", algo);

			let mut pieces = plain.clone();
			let mut c = Cipher::new(*algo, &key, &iv).unwrap();
			for part in pieces.chunks_mut(7) {
				c.apply_keystream(part);
			}
			assert_eq!(whole, pieces, "{:?}", algo);

			let mut dec = Cipher::new(*algo, &key, &iv).unwrap();
			dec.apply_keystream(&mut whole);
			assert_eq!(whole, plain, "{:?}", algo);
		}
	}

	#[test]
	fn test_aes_128_ctr_vector() {
		// NIST SP 800-38A F.5.1
		let key = [
			0x2b, 0x7e, 0x15, 0x16, 0x28, 0xae, 0xd2, 0xa6, 0xab, 0xf7, 0x15, 0x88, 0x09, 0xcf,
			0x4f, 0x3c,
		];
		let iv = [
			0xf0, 0xf1, 0xf2, 0xf3, 0xf4, 0xf5, 0xf6, 0xf7, 0xf8, 0xf9, 0xfa, 0xfb, 0xfc, 0xfd,
			0xfe, 0xff,
		];
		let mut buf = [
			0x6b, 0xc1, 0xbe, 0xe2, 0x2e, 0x40, 0x9f, 0x96, 0xe9, 0x3d, 0x7e, 0x11, 0x73, 0x93,
			0x17, 0x2a,
		];
		let expected = [
			0x87, 0x4d, 0x61, 0x91, 0xb6, 0x20, 0xe3, 0x26, 0x1b, 0xef, 0x68, 0x64, 0x99, 0x0d,
			0xb6, 0xce,
		];
		Cipher::new(Algorithm::Aes128Ctr, &key, &iv)
			.unwrap()
			.apply_keystream(&mut buf);
		assert_eq!(buf, expected);
	}

	#[test]
	fn test_wrong_lengths() {
		assert!(matches!(
			Cipher::new(Algorithm::Aes256Ctr, &[0_u8; 16], &[0_u8; 16]),
			Err(Error::InvalidKeyLength(16))
		));
		assert!(matches!(
			Cipher::new(Algorithm::ChaCha20Ietf, &[0_u8; 32], &[0_u8; 24]),
			Err(Error::InvalidNonceLength(24))
		));
	}
}

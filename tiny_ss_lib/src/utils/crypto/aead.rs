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

use super::Error;
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use chacha20poly1305::{
	aead::{generic_array::GenericArray, AeadInPlace, KeyInit},
	ChaCha20Poly1305, XChaCha20Poly1305,
};

pub const TAG_LEN: usize = 16;
pub const MAX_NONCE_LEN: usize = 24;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Algorithm {
	Aes128Gcm,
	Aes256Gcm,
	ChaCha20Poly1305,
	XChaCha20Poly1305,
}

impl Algorithm {
	#[inline]
	#[must_use]
	pub fn key_size(self) -> usize {
		match self {
			Self::Aes128Gcm => 16,
			Self::Aes256Gcm | Self::ChaCha20Poly1305 | Self::XChaCha20Poly1305 => 32,
		}
	}

	#[inline]
	#[must_use]
	pub fn nonce_size(self) -> usize {
		match self {
			Self::Aes128Gcm | Self::Aes256Gcm | Self::ChaCha20Poly1305 => 12,
			Self::XChaCha20Poly1305 => 24,
		}
	}
}

/// An initialized AEAD primitive.
///
/// It holds no nonce, callers must supply one for every operation.
#[derive(Clone)]
pub enum Cipher {
	Aes128Gcm(Aes128Gcm),
	Aes256Gcm(Aes256Gcm),
	ChaCha20Poly1305(ChaCha20Poly1305),
	XChaCha20Poly1305(XChaCha20Poly1305),
}

impl Cipher {
	/// Creates a new cipher of `algo` with `key`.
	///
	/// # Errors
	///
	/// Returns [`Error::InvalidKeyLength`] if `key` does not match `algo.key_size()`.
	pub fn new(algo: Algorithm, key: &[u8]) -> Result<Self, Error> {
		let invalid = |_| Error::InvalidKeyLength(key.len());
		Ok(match algo {
			Algorithm::Aes128Gcm => Self::Aes128Gcm(Aes128Gcm::new_from_slice(key).map_err(invalid)?),
			Algorithm::Aes256Gcm => Self::Aes256Gcm(Aes256Gcm::new_from_slice(key).map_err(invalid)?),
			Algorithm::ChaCha20Poly1305 => {
				Self::ChaCha20Poly1305(ChaCha20Poly1305::new_from_slice(key).map_err(invalid)?)
			}
			Algorithm::XChaCha20Poly1305 => {
				Self::XChaCha20Poly1305(XChaCha20Poly1305::new_from_slice(key).map_err(invalid)?)
			}
		})
	}

	#[must_use]
	pub fn algorithm(&self) -> Algorithm {
		match self {
			Self::Aes128Gcm(_) => Algorithm::Aes128Gcm,
			Self::Aes256Gcm(_) => Algorithm::Aes256Gcm,
			Self::ChaCha20Poly1305(_) => Algorithm::ChaCha20Poly1305,
			Self::XChaCha20Poly1305(_) => Algorithm::XChaCha20Poly1305,
		}
	}

	#[inline]
	#[must_use]
	pub fn nonce_size(&self) -> usize {
		self.algorithm().nonce_size()
	}

	/// Encrypts `buf` in place and returns the tag.
	///
	/// # Errors
	///
	/// Returns an error if `nonce` has the wrong length or `buf` is too large.
	pub fn seal_inplace(
		&self,
		nonce: &[u8],
		buf: &mut [u8],
		aad: &[u8],
	) -> Result<[u8; TAG_LEN], Error> {
		if nonce.len() != self.nonce_size() {
			return Err(Error::InvalidNonceLength(nonce.len()));
		}
		// Nonce sizes differ between variants, so each arm builds its own array.
		let tag = match self {
			Self::Aes128Gcm(c) => c.encrypt_in_place_detached(GenericArray::from_slice(nonce), aad, buf),
			Self::Aes256Gcm(c) => c.encrypt_in_place_detached(GenericArray::from_slice(nonce), aad, buf),
			Self::ChaCha20Poly1305(c) => {
				c.encrypt_in_place_detached(GenericArray::from_slice(nonce), aad, buf)
			}
			Self::XChaCha20Poly1305(c) => {
				c.encrypt_in_place_detached(GenericArray::from_slice(nonce), aad, buf)
			}
		}
		.map_err(|_| Error::Seal(buf.len()))?;
		let mut result = [0_u8; TAG_LEN];
		result.copy_from_slice(tag.as_slice());
		Ok(result)
	}

	/// Decrypts `buf` (cipher text followed by a tag) in place
	/// and returns the plain text part of `buf`.
	///
	/// # Errors
	///
	/// Returns [`Error::Authentication`] if the tag does not match.
	pub fn open_inplace<'b>(
		&self,
		nonce: &[u8],
		buf: &'b mut [u8],
		aad: &[u8],
	) -> Result<&'b mut [u8], Error> {
		if nonce.len() != self.nonce_size() {
			return Err(Error::InvalidNonceLength(nonce.len()));
		}
		if buf.len() < TAG_LEN {
			return Err(Error::Authentication);
		}
		let (text, tag) = buf.split_at_mut(buf.len() - TAG_LEN);
		let tag = GenericArray::from_slice(tag);
		match self {
			Self::Aes128Gcm(c) => {
				c.decrypt_in_place_detached(GenericArray::from_slice(nonce), aad, text, tag)
			}
			Self::Aes256Gcm(c) => {
				c.decrypt_in_place_detached(GenericArray::from_slice(nonce), aad, text, tag)
			}
			Self::ChaCha20Poly1305(c) => {
				c.decrypt_in_place_detached(GenericArray::from_slice(nonce), aad, text, tag)
			}
			Self::XChaCha20Poly1305(c) => {
				c.decrypt_in_place_detached(GenericArray::from_slice(nonce), aad, text, tag)
			}
		}
		.map_err(|_| Error::Authentication)?;
		Ok(text)
	}
}

/// Seals with a [`Cipher`], advancing its own nonce after every successful call.
#[derive(Clone)]
pub struct Encryptor {
	cipher: Cipher,
	nonce: nonce::CounterSequence,
}

impl Encryptor {
	/// Creates an encryptor with an all-zero nonce.
	#[must_use]
	pub fn new(cipher: Cipher) -> Self {
		let nonce = nonce::CounterSequence::new(cipher.nonce_size());
		Self { cipher, nonce }
	}

	/// # Errors
	///
	/// Returns [`Error::InvalidNonceLength`] if `nonce` does not fit `cipher`.
	pub fn with_nonce(cipher: Cipher, nonce: nonce::CounterSequence) -> Result<Self, Error> {
		if nonce.len() != cipher.nonce_size() {
			return Err(Error::InvalidNonceLength(nonce.len()));
		}
		Ok(Self { cipher, nonce })
	}

	/// # Errors
	///
	/// See [`Cipher::seal_inplace`].
	pub fn seal_inplace(&mut self, buf: &mut [u8], aad: &[u8]) -> Result<[u8; TAG_LEN], Error> {
		let tag = self.cipher.seal_inplace(self.nonce.curr(), buf, aad)?;
		self.nonce.update();
		Ok(tag)
	}

	/// Seal `buf[start_pos..]` and append the tag to `buf`.
	///
	/// # Errors
	///
	/// See [`Cipher::seal_inplace`].
	#[inline]
	pub fn seal_inplace_append_tag(
		&mut self,
		start_pos: usize,
		buf: &mut Vec<u8>,
		aad: &[u8],
	) -> Result<(), Error> {
		let tag = self.seal_inplace(&mut buf[start_pos..], aad)?;
		buf.extend_from_slice(&tag);
		Ok(())
	}

	#[inline]
	#[must_use]
	pub fn nonce(&self) -> &nonce::CounterSequence {
		&self.nonce
	}

	#[inline]
	#[must_use]
	pub fn into_parts(self) -> (Cipher, nonce::CounterSequence) {
		(self.cipher, self.nonce)
	}
}

/// Opens with a [`Cipher`], advancing its own nonce after every successful call.
#[derive(Clone)]
pub struct Decryptor {
	cipher: Cipher,
	nonce: nonce::CounterSequence,
}

impl Decryptor {
	/// Creates a decryptor with an all-zero nonce.
	#[must_use]
	pub fn new(cipher: Cipher) -> Self {
		let nonce = nonce::CounterSequence::new(cipher.nonce_size());
		Self { cipher, nonce }
	}

	/// # Errors
	///
	/// See [`Cipher::open_inplace`].
	pub fn open_inplace<'b>(
		&mut self,
		buf: &'b mut [u8],
		aad: &[u8],
	) -> Result<&'b mut [u8], Error> {
		let text = self.cipher.open_inplace(self.nonce.curr(), buf, aad)?;
		self.nonce.update();
		Ok(text)
	}

	#[inline]
	#[must_use]
	pub fn nonce(&self) -> &nonce::CounterSequence {
		&self.nonce
	}

	#[inline]
	pub fn nonce_mut(&mut self) -> &mut nonce::CounterSequence {
		&mut self.nonce
	}
}

pub mod nonce {
	use super::MAX_NONCE_LEN;

	/// A nonce sequence that treats nonce as an unsigned little-endian integer and
	/// increase its value by 1 when `update` function is called.
	#[derive(Clone, Debug, PartialEq, Eq)]
	pub struct CounterSequence {
		nonce: [u8; MAX_NONCE_LEN],
		len: usize,
	}

	impl CounterSequence {
		/// Creates an all-zero nonce of `len` bytes.
		///
		/// # Panics
		///
		/// Panics if `len` is larger than [`MAX_NONCE_LEN`].
		#[inline]
		#[must_use]
		pub fn new(len: usize) -> Self {
			assert!(len <= MAX_NONCE_LEN, "nonce length {} too large", len);
			Self {
				nonce: [0_u8; MAX_NONCE_LEN],
				len,
			}
		}

		/// Returns `None` if `nonce` is longer than [`MAX_NONCE_LEN`].
		#[must_use]
		pub fn from_slice(nonce: &[u8]) -> Option<Self> {
			if nonce.len() > MAX_NONCE_LEN {
				return None;
			}
			let mut result = Self::new(nonce.len());
			result.nonce[..nonce.len()].copy_from_slice(nonce);
			Some(result)
		}

		#[inline]
		#[must_use]
		pub fn curr(&self) -> &[u8] {
			&self.nonce[..self.len]
		}

		#[inline]
		#[must_use]
		pub fn len(&self) -> usize {
			self.len
		}

		#[inline]
		#[must_use]
		pub fn is_empty(&self) -> bool {
			self.len == 0
		}

		#[inline]
		pub fn update(&mut self) {
			increase(&mut self.nonce[..self.len]);
		}
	}

	#[inline]
	pub fn increase(nonce: &mut [u8]) {
		for i in nonce {
			if std::u8::MAX == *i {
				*i = 0;
			} else {
				*i += 1;
				return;
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::{nonce::CounterSequence, *};

	const ALGOS: [Algorithm; 4] = [
		Algorithm::Aes128Gcm,
		Algorithm::Aes256Gcm,
		Algorithm::ChaCha20Poly1305,
		Algorithm::XChaCha20Poly1305,
	];

	#[test]
	fn test_nonce_increase() {
		let mut nonce = [0_u8; 3];
		nonce::increase(&mut nonce);
		assert_eq!(nonce, [1, 0, 0]);

		let mut nonce = [0xff_u8, 0xff, 0];
		nonce::increase(&mut nonce);
		assert_eq!(nonce, [0, 0, 1]);

		let mut nonce = [0xff_u8; 3];
		nonce::increase(&mut nonce);
		assert_eq!(nonce, [0, 0, 0]);
	}

	#[test]
	fn test_counter_sequence() {
		let mut seq = CounterSequence::new(12);
		assert_eq!(seq.curr(), &[0_u8; 12]);
		for _ in 0..256 {
			seq.update();
		}
		let mut expected = [0_u8; 12];
		expected[1] = 1;
		assert_eq!(seq.curr(), &expected);
		assert!(CounterSequence::from_slice(&[0_u8; 25]).is_none());
	}

	#[test]
	fn test_seal_open() {
		for algo in &ALGOS {
			let key = vec![7_u8; algo.key_size()];
			let mut enc = Encryptor::new(Cipher::new(*algo, &key).unwrap());
			let mut dec = Decryptor::new(Cipher::new(*algo, &key).unwrap());

			for msg in &[&b"first"[..], &b"second message"[..]] {
				let mut buf = msg.to_vec();
				enc.seal_inplace_append_tag(0, &mut buf, &[]).unwrap();
				assert_eq!(buf.len(), msg.len() + TAG_LEN);
				assert_ne!(&buf[..msg.len()], *msg);
				let text = dec.open_inplace(&mut buf, &[]).unwrap();
				assert_eq!(text, *msg);
			}
			assert_eq!(enc.nonce(), dec.nonce());
			assert_eq!(enc.nonce().len(), algo.nonce_size());
		}
	}

	#[test]
	fn test_open_tampered() {
		for algo in &ALGOS {
			let key = vec![1_u8; algo.key_size()];
			let cipher = Cipher::new(*algo, &key).unwrap();
			let nonce = CounterSequence::new(algo.nonce_size());
			let mut buf = b"tamper".to_vec();
			let tag = cipher.seal_inplace(nonce.curr(), &mut buf, &[]).unwrap();
			buf.extend_from_slice(&tag);
			let last = buf.len() - 1;
			buf[last] ^= 1;

			let mut dec = Decryptor::new(cipher);
			assert!(matches!(
				dec.open_inplace(&mut buf, &[]),
				Err(Error::Authentication)
			));
			// Failed open must not advance nonce.
			assert_eq!(dec.nonce(), &nonce);
		}
	}

	#[test]
	fn test_invalid_key_length() {
		assert!(matches!(
			Cipher::new(Algorithm::ChaCha20Poly1305, &[0_u8; 16]),
			Err(Error::InvalidKeyLength(16))
		));
	}
}

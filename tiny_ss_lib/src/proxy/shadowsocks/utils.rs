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

use crate::{
	prelude::*,
	protocol::socks_addr::ReadError,
	utils::{
		codec,
		crypto::{self, aead, stream},
	},
};
use bytes::Bytes;
use hkdf::Hkdf;
use md5::{digest::Digest, Md5};
use sha1::Sha1;
use std::{fmt, io};

const INFO: &[u8] = b"ss-subkey";

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("Shadowsocks error (unsupported method '{0}')")]
	UnsupportedMethod(String),
	#[error("Shadowsocks error (password cannot be empty)")]
	EmptyPassword,
	#[error("Shadowsocks framing error ({0})")]
	Framing(BoxStdErr),
	#[error("Shadowsocks error (authentication failed)")]
	Authentication,
	#[error("Shadowsocks error ({0})")]
	FailedCrypto(crypto::Error),
	#[error("Shadowsocks error ({0})")]
	FailedAddressParsing(ReadError),
	#[error("Shadowsocks IO error ({0})")]
	Io(io::Error),
}

impl Error {
	/// Returns true if this error comes from invalid settings,
	/// which will never succeed on retry.
	#[inline]
	#[must_use]
	pub fn is_configuration(&self) -> bool {
		matches!(self, Self::UnsupportedMethod(_) | Self::EmptyPassword)
	}
}

impl From<ReadError> for Error {
	fn from(e: ReadError) -> Self {
		Error::FailedAddressParsing(e)
	}
}

impl From<crypto::Error> for Error {
	fn from(e: crypto::Error) -> Self {
		match e {
			crypto::Error::Authentication => Error::Authentication,
			e => Error::FailedCrypto(e),
		}
	}
}

impl From<io::Error> for Error {
	fn from(e: io::Error) -> Self {
		// Codec errors travel inside `io::Error`, take them out.
		let is_auth = codec::Error::from_io(&e).map(codec::Error::is_authentication);
		match is_auth {
			None => Error::Io(e),
			Some(true) => Error::Authentication,
			Some(false) => Error::Framing(
				e.into_inner()
					.unwrap_or_else(|| "unknown framing error".into()),
			),
		}
	}
}

impl From<Error> for io::Error {
	fn from(e: Error) -> Self {
		let kind = match e {
			Error::Io(e) => return e,
			Error::Framing(_) | Error::Authentication => io::ErrorKind::InvalidData,
			_ => io::ErrorKind::InvalidInput,
		};
		io::Error::new(kind, e)
	}
}

/// Derive the master key from `password` by iterating MD5
/// (`D_i = MD5(D_{i-1} | password)`) until there are `key_len` bytes.
pub fn password_to_key(key_len: usize, password: &str) -> Bytes {
	let digest_len = Md5::output_size();
	let mut result = Vec::with_capacity(std::cmp::max(key_len, digest_len) * 2);

	let mut m = None;
	let mut d = Md5::new();
	while result.len() < key_len {
		if let Some(ref rm) = m {
			Digest::update(&mut d, rm);
		}
		Digest::update(&mut d, password);
		let digest = d.finalize_reset();
		result.put_slice(&digest);

		m = Some(digest);
	}

	result.truncate(key_len);
	result.into()
}

/// Derive the sub-key of a single direction with HKDF-SHA1.
///
/// # Errors
///
/// Returns an error if `len` is too large for HKDF-SHA1.
pub fn key_to_session_key(key: &[u8], salt: &[u8], len: usize) -> Result<Vec<u8>, Error> {
	let h = Hkdf::<Sha1>::new(Some(salt), key);
	let mut okm = vec![0_u8; len];
	h.expand(INFO, &mut okm)
		.map_err(|_| Error::FailedCrypto(crypto::Error::InvalidKeyLength(len)))?;
	Ok(okm)
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "use_serde", derive(serde::Deserialize))]
pub enum Method {
	#[cfg_attr(feature = "use_serde", serde(rename = "aes-128-ctr"))]
	Aes128Ctr,
	#[cfg_attr(feature = "use_serde", serde(rename = "aes-192-ctr"))]
	Aes192Ctr,
	#[cfg_attr(feature = "use_serde", serde(rename = "aes-256-ctr"))]
	Aes256Ctr,
	#[cfg_attr(feature = "use_serde", serde(rename = "rc4-md5"))]
	Rc4Md5,
	#[cfg_attr(feature = "use_serde", serde(rename = "chacha20-ietf"))]
	ChaCha20Ietf,
	#[cfg_attr(feature = "use_serde", serde(rename = "xchacha20"))]
	XChaCha20,
	#[cfg_attr(feature = "use_serde", serde(rename = "aes-128-gcm"))]
	Aes128Gcm,
	#[cfg_attr(feature = "use_serde", serde(rename = "aes-256-gcm"))]
	Aes256Gcm,
	#[cfg_attr(feature = "use_serde", serde(rename = "chacha20-ietf-poly1305"))]
	ChaCha20IetfPoly1305,
	#[cfg_attr(feature = "use_serde", serde(rename = "xchacha20-ietf-poly1305"))]
	XChaCha20IetfPoly1305,
}

/// Family of a [`Method`] with its underlying algorithm.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Kind {
	Aead(aead::Algorithm),
	/// Legacy methods without authentication.
	Stream(stream::Algorithm),
}

/// A primitive ready to process one direction of a connection.
pub enum Primitive {
	Aead(aead::Cipher),
	Stream(stream::Cipher),
}

impl Method {
	pub const ALL: [Method; 10] = [
		Method::Aes128Ctr,
		Method::Aes192Ctr,
		Method::Aes256Ctr,
		Method::Rc4Md5,
		Method::ChaCha20Ietf,
		Method::XChaCha20,
		Method::Aes128Gcm,
		Method::Aes256Gcm,
		Method::ChaCha20IetfPoly1305,
		Method::XChaCha20IetfPoly1305,
	];

	#[inline]
	#[must_use]
	pub fn new_from_str(s: &str) -> Option<Self> {
		Some(match s {
			"aes-128-ctr" => Method::Aes128Ctr,
			"aes-192-ctr" => Method::Aes192Ctr,
			"aes-256-ctr" => Method::Aes256Ctr,
			"rc4-md5" => Method::Rc4Md5,
			"chacha20-ietf" => Method::ChaCha20Ietf,
			"xchacha20" => Method::XChaCha20,
			"aes-128-gcm" => Method::Aes128Gcm,
			"aes-256-gcm" => Method::Aes256Gcm,
			"chacha20-ietf-poly1305" => Method::ChaCha20IetfPoly1305,
			"xchacha20-ietf-poly1305" => Method::XChaCha20IetfPoly1305,
			_ => return None,
		})
	}

	#[must_use]
	pub fn as_str(self) -> &'static str {
		match self {
			Method::Aes128Ctr => "aes-128-ctr",
			Method::Aes192Ctr => "aes-192-ctr",
			Method::Aes256Ctr => "aes-256-ctr",
			Method::Rc4Md5 => "rc4-md5",
			Method::ChaCha20Ietf => "chacha20-ietf",
			Method::XChaCha20 => "xchacha20",
			Method::Aes128Gcm => "aes-128-gcm",
			Method::Aes256Gcm => "aes-256-gcm",
			Method::ChaCha20IetfPoly1305 => "chacha20-ietf-poly1305",
			Method::XChaCha20IetfPoly1305 => "xchacha20-ietf-poly1305",
		}
	}

	#[must_use]
	pub fn kind(self) -> Kind {
		match self {
			Method::Aes128Ctr => Kind::Stream(stream::Algorithm::Aes128Ctr),
			Method::Aes192Ctr => Kind::Stream(stream::Algorithm::Aes192Ctr),
			Method::Aes256Ctr => Kind::Stream(stream::Algorithm::Aes256Ctr),
			Method::Rc4Md5 => Kind::Stream(stream::Algorithm::Rc4Md5),
			Method::ChaCha20Ietf => Kind::Stream(stream::Algorithm::ChaCha20Ietf),
			Method::XChaCha20 => Kind::Stream(stream::Algorithm::XChaCha20),
			Method::Aes128Gcm => Kind::Aead(aead::Algorithm::Aes128Gcm),
			Method::Aes256Gcm => Kind::Aead(aead::Algorithm::Aes256Gcm),
			Method::ChaCha20IetfPoly1305 => Kind::Aead(aead::Algorithm::ChaCha20Poly1305),
			Method::XChaCha20IetfPoly1305 => Kind::Aead(aead::Algorithm::XChaCha20Poly1305),
		}
	}

	#[inline]
	#[must_use]
	pub fn is_aead(self) -> bool {
		matches!(self.kind(), Kind::Aead(_))
	}

	/// Length of the master key.
	#[must_use]
	pub fn key_len(self) -> usize {
		match self.kind() {
			Kind::Aead(algo) => algo.key_size(),
			Kind::Stream(algo) => algo.key_size(),
		}
	}

	/// Length of the salt (IV for stream methods) in front of each direction.
	///
	/// For AEAD methods this is also the length of the sub-key.
	#[must_use]
	pub fn salt_len(self) -> usize {
		match self.kind() {
			Kind::Aead(algo) => algo.key_size(),
			Kind::Stream(algo) => algo.iv_size(),
		}
	}

	/// Create the primitive of one direction from the master key
	/// and the salt of that direction.
	///
	/// # Errors
	///
	/// Returns an error if `key` or `salt` has the wrong length.
	pub fn new_primitive(self, key: &[u8], salt: &[u8]) -> Result<Primitive, Error> {
		if salt.len() != self.salt_len() {
			return Err(crypto::Error::InvalidNonceLength(salt.len()).into());
		}
		Ok(match self.kind() {
			Kind::Aead(algo) => {
				let session_key = key_to_session_key(key, salt, algo.key_size())?;
				Primitive::Aead(aead::Cipher::new(algo, &session_key)?)
			}
			Kind::Stream(algo) => Primitive::Stream(stream::Cipher::new(algo, key, salt)?),
		})
	}
}

impl FromStr for Method {
	type Err = Error;

	#[inline]
	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::new_from_str(s).ok_or_else(|| Error::UnsupportedMethod(s.into()))
	}
}

impl fmt::Display for Method {
	#[inline]
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

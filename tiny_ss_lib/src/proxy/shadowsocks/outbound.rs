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

use super::{password_to_key, tcp::ClientStream, Error, Method};
use crate::prelude::*;
use bytes::Bytes;
use std::{io, time::Duration};
use tokio::{
	io::{ReadHalf, WriteHalf},
	net::{
		tcp::{OwnedReadHalf, OwnedWriteHalf},
		TcpStream, ToSocketAddrs,
	},
	time::timeout,
};

/// Size of the buffers used when relaying.
pub const DEFAULT_BUFFER_SIZE: usize = 1024;
pub const DEFAULT_SERVER: &str = "127.0.0.1:7777";
const DIAL_TCP_TIMEOUT: Duration = Duration::from_secs(10);

/// Creates client connections with a fixed method and password.
///
/// Cloning is cheap, all clones share the same master key.
#[derive(Clone)]
pub struct Dialer {
	method: Method,
	key: Bytes,
}

impl Dialer {
	/// Creates a new [`Dialer`] from a method name and a password.
	///
	/// # Errors
	///
	/// Returns [`Error::UnsupportedMethod`] if `method` is unknown,
	/// or [`Error::EmptyPassword`] if `password` is empty.
	pub fn new(method: &str, password: &str) -> Result<Self, Error> {
		Self::with_method(Method::from_str(method)?, password)
	}

	/// Creates a new [`Dialer`].
	///
	/// # Errors
	///
	/// Returns [`Error::EmptyPassword`] if `password` is empty.
	pub fn with_method(method: Method, password: &str) -> Result<Self, Error> {
		if password.is_empty() {
			return Err(Error::EmptyPassword);
		}
		Ok(Self {
			method,
			key: password_to_key(method.key_len(), password),
		})
	}

	#[inline]
	#[must_use]
	pub fn method(&self) -> Method {
		self.method
	}

	/// Wrap `r` and `w` into a connection to `dst`.
	///
	/// The request header is sent together with the first write.
	pub fn dial_early_split<R, W>(&self, r: R, w: W, dst: SocksAddr) -> ClientStream<R, W> {
		trace!("Creating Shadowsocks ({}) connection to {}", self.method, dst);
		ClientStream::new(r, w, self.method, self.key.clone(), dst)
	}

	/// Wrap `r` and `w` into a connection to `dst`,
	/// and send the request header immediately.
	///
	/// # Errors
	///
	/// Returns an error if the request cannot be sent.
	pub async fn dial_split<R, W>(
		&self,
		r: R,
		w: W,
		dst: SocksAddr,
	) -> Result<ClientStream<R, W>, Error>
	where
		W: AsyncWrite + Unpin,
	{
		let mut stream = self.dial_early_split(r, w, dst);
		stream.w.send_request().await?;
		Ok(stream)
	}

	/// Same as [`Self::dial_early_split`] but with a single duplex stream.
	pub fn dial_early_conn<S>(
		&self,
		stream: S,
		dst: SocksAddr,
	) -> ClientStream<ReadHalf<S>, WriteHalf<S>>
	where
		S: AsyncRead + AsyncWrite,
	{
		let (r, w) = tokio::io::split(stream);
		self.dial_early_split(r, w, dst)
	}

	/// Same as [`Self::dial_split`] but with a single duplex stream.
	///
	/// # Errors
	///
	/// Returns an error if the request cannot be sent.
	pub async fn dial_conn<S>(
		&self,
		stream: S,
		dst: SocksAddr,
	) -> Result<ClientStream<ReadHalf<S>, WriteHalf<S>>, Error>
	where
		S: AsyncRead + AsyncWrite,
	{
		let (r, w) = tokio::io::split(stream);
		self.dial_split(r, w, dst).await
	}
}

#[derive(Debug, Default)]
#[cfg_attr(feature = "use_serde", derive(serde::Deserialize))]
pub struct SettingsBuilder {
	/// Host of the destination.
	pub remote_addr: String,
	/// Port of the destination.
	pub remote_port: String,
	pub password: String,
	pub method: String,
	/// Size of the relay buffers, or 0 for [`DEFAULT_BUFFER_SIZE`].
	#[cfg_attr(feature = "use_serde", serde(default))]
	pub internal_buffer_size: usize,
	/// Address of the Shadowsocks server, [`DEFAULT_SERVER`] if unset.
	#[cfg_attr(feature = "use_serde", serde(default))]
	pub server: Option<String>,
}

impl SettingsBuilder {
	/// Creates a Shadowsocks [`Settings`].
	///
	/// # Errors
	///
	/// Returns an error if method, password or any address is invalid.
	pub fn build(self) -> Result<Settings, Error> {
		let dialer = Dialer::new(&self.method, &self.password)?;
		let dst = SocksAddr::from_host_port(&self.remote_addr, &self.remote_port)?;
		let server = SocksAddr::from_str(self.server.as_deref().unwrap_or(DEFAULT_SERVER))?;
		let buffer_size = if self.internal_buffer_size == 0 {
			DEFAULT_BUFFER_SIZE
		} else {
			self.internal_buffer_size
		};
		Ok(Settings {
			dialer,
			dst,
			server,
			buffer_size,
		})
	}
}

pub struct Settings {
	dialer: Dialer,
	dst: SocksAddr,
	server: SocksAddr,
	buffer_size: usize,
}

impl Settings {
	#[inline]
	#[must_use]
	pub fn dialer(&self) -> &Dialer {
		&self.dialer
	}

	/// Destination that every connection asks the server to connect to.
	#[inline]
	#[must_use]
	pub fn dst(&self) -> &SocksAddr {
		&self.dst
	}

	#[inline]
	#[must_use]
	pub fn server(&self) -> &SocksAddr {
		&self.server
	}

	#[inline]
	#[must_use]
	pub fn buffer_size(&self) -> usize {
		self.buffer_size
	}

	/// Wrap an already connected `stream` to the server.
	pub fn wrap<S>(&self, stream: S) -> ClientStream<ReadHalf<S>, WriteHalf<S>>
	where
		S: AsyncRead + AsyncWrite,
	{
		self.dialer.dial_early_conn(stream, self.dst.clone())
	}

	/// Connect to the server and wrap the connection.
	///
	/// # Errors
	///
	/// Returns an error if the server cannot be reached.
	pub async fn connect(&self) -> Result<ClientStream<OwnedReadHalf, OwnedWriteHalf>, Error> {
		debug!(
			"Creating Shadowsocks connection to '{}', target: '{}'",
			self.server, self.dst
		);
		let port = self.server.port;
		let stream = match &self.server.dest {
			SocksDestination::Name(name) => {
				connect_tcp_timeout((name.as_str(), port), DIAL_TCP_TIMEOUT).await
			}
			SocksDestination::Ip(ip) => connect_tcp_timeout((*ip, port), DIAL_TCP_TIMEOUT).await,
		};
		let stream = stream.map_err(|e| {
			debug!(
				"Error occurred when dialing TCP connection to '{}' ({})",
				self.server, e
			);
			e
		})?;
		let (r, w) = stream.into_split();
		Ok(self.dialer.dial_early_split(r, w, self.dst.clone()))
	}
}

async fn connect_tcp_timeout(
	addr: impl ToSocketAddrs,
	timeout_duration: Duration,
) -> io::Result<TcpStream> {
	match timeout(timeout_duration, TcpStream::connect(addr)).await {
		Ok(res) => res,
		Err(_) => Err(io::ErrorKind::TimedOut.into()),
	}
}

#[cfg(test)]
mod tests {
	use super::{super::test_utils::decode_request, *};
	use crate::utils::codec::{LENGTH_CHUNK_SIZE, OVERHEAD};
	use tokio::{
		io::{duplex, AsyncReadExt},
		net::TcpListener,
	};

	fn new_builder() -> SettingsBuilder {
		SettingsBuilder {
			remote_addr: "example.com".into(),
			remote_port: "443".into(),
			password: "testpass".into(),
			method: "chacha20-ietf-poly1305".into(),
			..SettingsBuilder::default()
		}
	}

	#[test]
	fn test_new_dialer() {
		let dialer = Dialer::new("xchacha20-ietf-poly1305", "testpass").unwrap();
		assert_eq!(dialer.method(), Method::XChaCha20IetfPoly1305);
		assert_eq!(dialer.key, password_to_key(32, "testpass"));

		let e = Dialer::new("invalid-method", "testpass").err().unwrap();
		assert!(e.is_configuration());
		assert!(matches!(e, Error::UnsupportedMethod(_)));

		let e = Dialer::new("aes-128-ctr", "").err().unwrap();
		assert!(e.is_configuration());
		assert!(matches!(e, Error::EmptyPassword));

		// Method is checked first.
		let e = Dialer::new("invalid-method", "").err().unwrap();
		assert!(matches!(e, Error::UnsupportedMethod(_)));
	}

	#[test]
	fn test_dial_conn() {
		let dialer = Dialer::new("chacha20-ietf-poly1305", "testpass").unwrap();
		let dst = SocksAddr::from_str("1.2.3.4:80").unwrap();
		let rt = tokio::runtime::Runtime::new().unwrap();
		rt.block_on(async {
			let (client, mut server) = duplex(1024);
			let stream = dialer.dial_conn(client, dst.clone()).await.unwrap();
			assert!(stream.w.is_keyed());
			assert!(!stream.r.is_keyed());

			// Request is sent before any write.
			let expected_len = 32 + LENGTH_CHUNK_SIZE + dst.serialized_len_atyp() + OVERHEAD;
			let mut raw = vec![0_u8; expected_len];
			server.read_exact(&mut raw).await.unwrap();
			let (salt, plain) = decode_request(dialer.method(), &dialer.key, &raw).await;
			assert_eq!(salt.len(), 32);
			let mut expected = Vec::new();
			dst.write_to(&mut expected);
			assert_eq!(plain, expected);
		});
	}

	#[test]
	fn test_dial_early_conn() {
		let dialer = Dialer::new("aes-256-ctr", "testpass").unwrap();
		let dst = SocksAddr::from_str("1.2.3.4:80").unwrap();
		let rt = tokio::runtime::Runtime::new().unwrap();
		rt.block_on(async {
			let (client, mut server) = duplex(1024);
			let mut stream = dialer.dial_early_conn(client, dst.clone());
			assert!(!stream.w.is_keyed());
			stream.write(b"GET").await.unwrap();
			stream.shutdown().await.unwrap();

			let mut raw = Vec::new();
			server.read_to_end(&mut raw).await.unwrap();
			let (salt, plain) = decode_request(dialer.method(), &dialer.key, &raw).await;
			assert_eq!(salt.len(), 16);
			let mut expected = Vec::new();
			dst.write_to(&mut expected);
			expected.extend_from_slice(b"GET");
			assert_eq!(plain, expected);
		});
	}

	#[test]
	fn test_build_settings() {
		let settings = new_builder().build().unwrap();
		assert_eq!(settings.dst(), &SocksAddr::from_str("example.com:443").unwrap());
		assert_eq!(settings.server().to_string(), DEFAULT_SERVER);
		assert_eq!(settings.buffer_size(), DEFAULT_BUFFER_SIZE);
		assert_eq!(settings.dialer().method(), Method::ChaCha20IetfPoly1305);

		let settings = SettingsBuilder {
			internal_buffer_size: 4096,
			server: Some("[::1]:8388".into()),
			..new_builder()
		}
		.build()
		.unwrap();
		assert_eq!(settings.buffer_size(), 4096);
		assert_eq!(settings.server().to_string(), "[::1]:8388");
	}

	#[test]
	fn test_build_settings_error() {
		let e = SettingsBuilder {
			method: "invalid-method".into(),
			..new_builder()
		}
		.build()
		.err()
		.unwrap();
		assert!(e.is_configuration());

		let e = SettingsBuilder {
			password: String::new(),
			..new_builder()
		}
		.build()
		.err()
		.unwrap();
		assert!(matches!(e, Error::EmptyPassword));

		let e = SettingsBuilder {
			remote_port: "https".into(),
			..new_builder()
		}
		.build()
		.err()
		.unwrap();
		assert!(matches!(e, Error::FailedAddressParsing(_)));

		let e = SettingsBuilder {
			remote_addr: "bad*.domain".into(),
			..new_builder()
		}
		.build()
		.err()
		.unwrap();
		assert!(matches!(e, Error::FailedAddressParsing(_)));

		// Only an unset server falls back to the default one.
		let e = SettingsBuilder {
			server: Some(String::new()),
			..new_builder()
		}
		.build()
		.err()
		.unwrap();
		assert!(matches!(e, Error::FailedAddressParsing(_)));
	}

	#[cfg(feature = "use_serde")]
	#[test]
	fn test_deserialize_settings() {
		let json = r#"{
			"remote_addr": "127.0.0.1",
			"remote_port": "8080",
			"password": "testpass",
			"method": "aes-128-gcm",
			"internal_buffer_size": 2048
		}"#;
		let builder: SettingsBuilder = serde_json::from_str(json).unwrap();
		assert!(builder.server.is_none());
		let settings = builder.build().unwrap();
		assert_eq!(settings.dst().to_string(), "127.0.0.1:8080");
		assert_eq!(settings.buffer_size(), 2048);
		assert_eq!(settings.dialer().method(), Method::Aes128Gcm);
	}

	#[test]
	fn test_connect() {
		let rt = tokio::runtime::Runtime::new().unwrap();
		rt.block_on(async {
			let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
			let server_addr = listener.local_addr().unwrap();
			let settings = SettingsBuilder {
				server: Some(server_addr.to_string()),
				..new_builder()
			}
			.build()
			.unwrap();

			let server_task = tokio::spawn(async move {
				let (mut stream, _) = listener.accept().await.unwrap();
				let mut raw = Vec::new();
				stream.read_to_end(&mut raw).await.unwrap();
				raw
			});

			let mut stream = settings.connect().await.unwrap();
			stream.write(b"ping").await.unwrap();
			stream.shutdown().await.unwrap();

			let raw = server_task.await.unwrap();
			let (_, plain) = decode_request(
				settings.dialer().method(),
				&settings.dialer().key,
				&raw,
			)
			.await;
			let mut expected = Vec::new();
			settings.dst().write_to(&mut expected);
			expected.extend_from_slice(b"ping");
			assert_eq!(plain, expected);
		});
	}
}

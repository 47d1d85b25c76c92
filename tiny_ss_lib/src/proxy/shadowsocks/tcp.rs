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
Shadowsocks TCP client session.

### AEAD

Each direction of an AEAD encrypted TCP stream starts with a randomly
generated salt used to derive the sub-key of that direction,
followed by any number of chunks (see [`crate::utils::codec`]).

To initiate a Shadowsocks connection, client must first send the target address
in [SOCKS5 address format] ( use [`SocksAddr::write_to`] to serialize ).
The address and the first payload are sealed together, so the first packet
looks like
```not_rust
+-------------------+------------------+---------------+
|      salt         |  target address  |     first     |
|                   |                  |    payload    |
+-------------------+------------------+---------------+
|  salt_len bytes   |      sealed in the same chunk    |
+-------------------+----------------------------------+
```

### Stream

Legacy stream methods send an IV instead of a salt, and the remaining
bytes are XORed with the keystream without any framing:
```not_rust
+-------------------+------------------+---------------+
|        IV         |  target address  |    payload    |
+-------------------+------------------+---------------+
|   iv_len bytes    |         keystream XORed          |
+-------------------+----------------------------------+
```

Beware that stream methods provide no authentication,
and should not be used in unsecured network.

[SOCKS5 address format]: https://tools.ietf.org/html/rfc1928#section-5
*/

use super::{utils::Primitive, Method};
use crate::{
	prelude::*,
	utils::{
		codec::{Reader, Writer, MAX_PACKET_SIZE},
		crypto::{
			aead::{nonce::CounterSequence, Cipher},
			stream,
		},
		poll_read_exact, poll_write_all,
	},
};
use bytes::Bytes;
use futures::{future::poll_fn, ready};
use rand::rngs::OsRng;
use std::{
	io, mem,
	task::{Context, Poll},
};
use tokio::io::ReadBuf;

fn faulted_err(name: &str) -> io::Error {
	io::Error::new(
		io::ErrorKind::BrokenPipe,
		format!("Shadowsocks {} is faulted", name),
	)
}

/// A client connection to a Shadowsocks server.
///
/// Each half owns the state of a single direction.
pub struct ClientStream<R, W> {
	pub r: ClientReadHalf<R>,
	pub w: ClientWriteHalf<W>,
}

impl<R, W> ClientStream<R, W> {
	/// Wrap `r` and `w` into a client connection to `dst`.
	///
	/// Nothing is sent until the first write.
	pub fn new(r: R, w: W, method: Method, key: Bytes, dst: SocksAddr) -> Self {
		Self {
			r: ClientReadHalf::new(r, method, key.clone()),
			w: ClientWriteHalf::new(w, method, key, dst),
		}
	}

	#[inline]
	pub fn into_split(self) -> (ClientReadHalf<R>, ClientWriteHalf<W>) {
		(self.r, self.w)
	}
}

impl<R, W> ClientStream<R, W>
where
	R: AsyncRead + Unpin,
	W: AsyncWrite + Unpin,
{
	/// See [`ClientReadHalf::read`].
	///
	/// # Errors
	///
	/// Returns the same error as [`ClientReadHalf::read`].
	#[inline]
	pub async fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
		self.r.read(dst).await
	}

	/// See [`ClientWriteHalf::write`].
	///
	/// # Errors
	///
	/// Returns the same error as [`ClientWriteHalf::write`].
	#[inline]
	pub async fn write(&mut self, src: &[u8]) -> io::Result<usize> {
		self.w.write(src).await
	}
}

impl<R, W> AsyncRead for ClientStream<R, W>
where
	R: AsyncRead + Unpin,
	W: Unpin,
{
	#[inline]
	fn poll_read(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<io::Result<()>> {
		Pin::new(&mut self.get_mut().r).poll_read(cx, buf)
	}
}

impl<R, W> AsyncWrite for ClientStream<R, W>
where
	R: Unpin,
	W: AsyncWrite + Unpin,
{
	#[inline]
	fn poll_write(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		src: &[u8],
	) -> Poll<io::Result<usize>> {
		Pin::new(&mut self.get_mut().w).poll_write(cx, src)
	}

	#[inline]
	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Pin::new(&mut self.get_mut().w).poll_flush(cx)
	}

	#[inline]
	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Pin::new(&mut self.get_mut().w).poll_shutdown(cx)
	}
}

// -------------------------------------------------------
//                       Write half
// -------------------------------------------------------

/// What seals the bytes after the request.
enum Sealer {
	Aead {
		cipher: Cipher,
		nonce: CounterSequence,
	},
	Stream(stream::Cipher),
}

enum WriteState<W> {
	/// Nothing has been sent yet.
	Unkeyed { w: W, dst: SocksAddr },
	/// Request packet is being written, `packet[pos..]` is left.
	Requesting {
		w: W,
		packet: Vec<u8>,
		pos: usize,
		early_len: usize,
		next: Sealer,
	},
	Aead(Writer<W>),
	Stream(StreamWriter<W>),
	Faulted,
}

struct StreamWriter<W> {
	w: W,
	cipher: stream::Cipher,
	/// `buf[pos..]` is waiting to be written.
	buf: Vec<u8>,
	pos: usize,
	consumed: usize,
}

impl<W> StreamWriter<W> {
	fn new(w: W, cipher: stream::Cipher, mut buf: Vec<u8>) -> Self {
		buf.clear();
		Self {
			w,
			cipher,
			buf,
			pos: 0,
			consumed: 0,
		}
	}
}

impl<W: AsyncWrite + Unpin> AsyncWrite for StreamWriter<W> {
	fn poll_write(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		src: &[u8],
	) -> Poll<io::Result<usize>> {
		let me = self.get_mut();
		if me.pos == me.buf.len() {
			if src.is_empty() {
				return Poll::Ready(Ok(0));
			}
			let src = &src[..src.len().min(MAX_PACKET_SIZE)];
			me.buf.clear();
			me.buf.extend_from_slice(src);
			me.cipher.apply_keystream(&mut me.buf);
			me.pos = 0;
			me.consumed = src.len();
		}
		ready!(poll_write_all(Pin::new(&mut me.w), cx, &mut me.pos, &me.buf))?;
		Poll::Ready(Ok(me.consumed))
	}

	#[inline]
	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Pin::new(&mut self.get_mut().w).poll_flush(cx)
	}

	#[inline]
	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Pin::new(&mut self.get_mut().w).poll_shutdown(cx)
	}
}

pub struct ClientWriteHalf<W> {
	method: Method,
	key: Bytes,
	state: WriteState<W>,
}

impl<W> ClientWriteHalf<W> {
	pub fn new(w: W, method: Method, key: Bytes, dst: SocksAddr) -> Self {
		Self {
			method,
			key,
			state: WriteState::Unkeyed { w, dst },
		}
	}

	/// Returns true if the request header has been sent.
	#[inline]
	pub fn is_keyed(&self) -> bool {
		matches!(self.state, WriteState::Aead(_) | WriteState::Stream(_))
	}

	#[inline]
	pub fn is_faulted(&self) -> bool {
		matches!(self.state, WriteState::Faulted)
	}

	fn fault_on_err<T>(&mut self, res: io::Result<T>) -> io::Result<T> {
		if let Err(e) = &res {
			debug!("Shadowsocks write half faulted ({})", e);
			// Inner writer is dropped.
			self.state = WriteState::Faulted;
		}
		res
	}
}

impl<W> ClientWriteHalf<W>
where
	W: AsyncWrite + Unpin,
{
	/// Encrypt and write all of `src`.
	///
	/// The first call sends the salt and the request header,
	/// with the front of `src` sealed together with the header.
	///
	/// # Errors
	///
	/// Returns an error if the handshake or writing fails.
	/// After any error this half is faulted and the inner writer is dropped.
	pub async fn write(&mut self, src: &[u8]) -> io::Result<usize> {
		let mut pos = 0;
		loop {
			let n = poll_fn(|cx| self.poll_write_priv(cx, &src[pos..])).await?;
			pos += n;
			if pos >= src.len() {
				return Ok(src.len());
			}
			if n == 0 {
				return Err(io::ErrorKind::WriteZero.into());
			}
		}
	}

	/// Send the request header without any payload if it has not been sent yet.
	///
	/// # Errors
	///
	/// Returns the same error as [`Self::write`].
	pub async fn send_request(&mut self) -> io::Result<()> {
		if let WriteState::Unkeyed { .. } | WriteState::Requesting { .. } = self.state {
			poll_fn(|cx| self.poll_write_priv(cx, &[])).await?;
		}
		Ok(())
	}

	fn poll_write_priv(
		&mut self,
		cx: &mut Context<'_>,
		src: &[u8],
	) -> Poll<io::Result<usize>> {
		let res = ready!(self.poll_write_inner(cx, src));
		Poll::Ready(self.fault_on_err(res))
	}

	fn poll_write_inner(
		&mut self,
		cx: &mut Context<'_>,
		src: &[u8],
	) -> Poll<io::Result<usize>> {
		loop {
			match &mut self.state {
				WriteState::Unkeyed { .. } => {
					if let WriteState::Unkeyed { w, dst } =
						mem::replace(&mut self.state, WriteState::Faulted)
					{
						self.state = build_request(self.method, &self.key, w, &dst, src)?;
					}
				}
				WriteState::Requesting { .. } => return self.poll_finish_request(cx),
				WriteState::Aead(w) => return Pin::new(w).poll_write(cx, src),
				WriteState::Stream(w) => return Pin::new(w).poll_write(cx, src),
				WriteState::Faulted => return Poll::Ready(Err(faulted_err("write half"))),
			}
		}
	}

	/// Finish writing the request packet if there is one.
	///
	/// Returns the length of early data carried by the request.
	fn poll_finish_request(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<usize>> {
		if let WriteState::Requesting { w, packet, pos, .. } = &mut self.state {
			ready!(poll_write_all(Pin::new(w), cx, pos, packet.as_slice()))?;
		}
		match mem::replace(&mut self.state, WriteState::Faulted) {
			WriteState::Requesting {
				w,
				packet,
				early_len,
				next,
				..
			} => {
				// Request packet is reused as the scratch buffer.
				self.state = match next {
					Sealer::Aead { cipher, nonce } => WriteState::Aead(Writer::new_raw(
						w,
						cipher,
						MAX_PACKET_SIZE,
						packet,
						nonce,
					)?),
					Sealer::Stream(cipher) => {
						WriteState::Stream(StreamWriter::new(w, cipher, packet))
					}
				};
				debug!(
					"Shadowsocks request sent with {} bytes of early data",
					early_len
				);
				Poll::Ready(Ok(early_len))
			}
			state => {
				self.state = state;
				Poll::Ready(Ok(0))
			}
		}
	}

	fn poll_flush_priv(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		ready!(self.poll_finish_request(cx))?;
		match &mut self.state {
			WriteState::Unkeyed { w, .. } => Pin::new(w).poll_flush(cx),
			WriteState::Aead(w) => Pin::new(w).poll_flush(cx),
			WriteState::Stream(w) => Pin::new(w).poll_flush(cx),
			WriteState::Requesting { .. } | WriteState::Faulted => {
				Poll::Ready(Err(faulted_err("write half")))
			}
		}
	}

	/// If nothing has been written, no request is sent.
	fn poll_shutdown_priv(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		ready!(self.poll_finish_request(cx))?;
		match &mut self.state {
			WriteState::Unkeyed { w, .. } => Pin::new(w).poll_shutdown(cx),
			WriteState::Aead(w) => Pin::new(w).poll_shutdown(cx),
			WriteState::Stream(w) => Pin::new(w).poll_shutdown(cx),
			WriteState::Requesting { .. } | WriteState::Faulted => {
				Poll::Ready(Err(faulted_err("write half")))
			}
		}
	}
}

impl<W> AsyncWrite for ClientWriteHalf<W>
where
	W: AsyncWrite + Unpin,
{
	/// The first call sends the request, and returns the number of bytes
	/// of `src` carried by it.
	fn poll_write(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		src: &[u8],
	) -> Poll<io::Result<usize>> {
		self.get_mut().poll_write_priv(cx, src)
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		let me = self.get_mut();
		let res = ready!(me.poll_flush_priv(cx));
		Poll::Ready(me.fault_on_err(res))
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		let me = self.get_mut();
		let res = ready!(me.poll_shutdown_priv(cx));
		Poll::Ready(me.fault_on_err(res))
	}
}

/// Build the request packet with a fresh salt.
///
/// As much of `payload` as fits into the first chunk is sent as early data.
fn build_request<W>(
	method: Method,
	key: &[u8],
	w: W,
	dst: &SocksAddr,
	payload: &[u8],
) -> io::Result<WriteState<W>> {
	let mut salt = vec![0_u8; method.salt_len()];
	// Very unlikely to generate a used salt with the OS RNG.
	OsRng.fill_bytes(&mut salt);
	let primitive = method.new_primitive(key, &salt)?;

	let header_len = dst.serialized_len_atyp();
	let early = &payload[..payload.len().min(MAX_PACKET_SIZE.saturating_sub(header_len))];
	let mut header = Vec::with_capacity(header_len + early.len());
	dst.write_to(&mut header);
	header.extend_from_slice(early);

	let mut packet = salt;
	let next = match primitive {
		Primitive::Aead(cipher) => {
			let mut handshake_writer =
				Writer::new(tokio::io::sink(), cipher.clone(), MAX_PACKET_SIZE);
			handshake_writer.seal_into(&mut packet, &header)?;
			Sealer::Aead {
				cipher,
				nonce: handshake_writer.take_nonce(),
			}
		}
		Primitive::Stream(mut cipher) => {
			cipher.apply_keystream(&mut header);
			packet.extend_from_slice(&header);
			Sealer::Stream(cipher)
		}
	};
	trace!(
		"Sending Shadowsocks request ({} bytes) to {}",
		packet.len(),
		dst
	);
	Ok(WriteState::Requesting {
		w,
		packet,
		pos: 0,
		early_len: early.len(),
		next,
	})
}

// -------------------------------------------------------
//                       Read half
// -------------------------------------------------------

enum ReadState<R> {
	/// Salt has not been fully received yet, `salt[..pos]` is filled.
	Unkeyed { r: R, salt: Vec<u8>, pos: usize },
	Aead(Reader<R>),
	Stream { r: R, cipher: stream::Cipher },
	Faulted,
}

pub struct ClientReadHalf<R> {
	method: Method,
	key: Bytes,
	state: ReadState<R>,
}

impl<R> ClientReadHalf<R> {
	pub fn new(r: R, method: Method, key: Bytes) -> Self {
		Self {
			method,
			key,
			state: ReadState::Unkeyed {
				r,
				salt: vec![0_u8; method.salt_len()],
				pos: 0,
			},
		}
	}

	/// Returns true if the salt of the server has been received.
	#[inline]
	pub fn is_keyed(&self) -> bool {
		matches!(self.state, ReadState::Aead(_) | ReadState::Stream { .. })
	}

	#[inline]
	pub fn is_faulted(&self) -> bool {
		matches!(self.state, ReadState::Faulted)
	}
}

impl<R> ClientReadHalf<R>
where
	R: AsyncRead + Unpin,
{
	/// Read and decrypt bytes into `dst`.
	///
	/// The first call waits for the salt of the server.
	/// Returns `Ok(0)` on EOF, including EOF before any salt byte.
	///
	/// # Errors
	///
	/// Returns an error if the salt is truncated, or the inner reader fails,
	/// or the data cannot be authenticated.
	/// After any error this half is faulted and the inner reader is dropped.
	pub async fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
		poll_fn(|cx| self.poll_read_priv(cx, dst)).await
	}

	fn poll_read_priv(
		&mut self,
		cx: &mut Context<'_>,
		dst: &mut [u8],
	) -> Poll<io::Result<usize>> {
		let res = ready!(self.poll_read_inner(cx, dst));
		if let Err(e) = &res {
			debug!("Shadowsocks read half faulted ({})", e);
			self.state = ReadState::Faulted;
		}
		Poll::Ready(res)
	}

	fn poll_read_inner(
		&mut self,
		cx: &mut Context<'_>,
		dst: &mut [u8],
	) -> Poll<io::Result<usize>> {
		loop {
			match &mut self.state {
				ReadState::Unkeyed { r, salt, pos } => {
					// EOF before salt.
					if ready!(poll_read_exact(Pin::new(r), cx, salt, pos))? == 0 {
						return Poll::Ready(Ok(0));
					}
					if let ReadState::Unkeyed { r, salt, .. } =
						mem::replace(&mut self.state, ReadState::Faulted)
					{
						trace!("Shadowsocks salt received ({} bytes)", salt.len());
						self.state = match self.method.new_primitive(&self.key, &salt)? {
							Primitive::Aead(cipher) => {
								ReadState::Aead(Reader::new(r, cipher, MAX_PACKET_SIZE))
							}
							Primitive::Stream(cipher) => ReadState::Stream { r, cipher },
						};
					}
				}
				ReadState::Aead(r) => {
					let mut buf = ReadBuf::new(&mut *dst);
					ready!(Pin::new(r).poll_read(cx, &mut buf))?;
					return Poll::Ready(Ok(buf.filled().len()));
				}
				ReadState::Stream { r, cipher } => {
					let n = {
						let mut buf = ReadBuf::new(&mut *dst);
						ready!(Pin::new(r).poll_read(cx, &mut buf))?;
						buf.filled().len()
					};
					cipher.apply_keystream(&mut dst[..n]);
					return Poll::Ready(Ok(n));
				}
				ReadState::Faulted => return Poll::Ready(Err(faulted_err("read half"))),
			}
		}
	}
}

impl<R> AsyncRead for ClientReadHalf<R>
where
	R: AsyncRead + Unpin,
{
	fn poll_read(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<io::Result<()>> {
		let n = ready!(self.get_mut().poll_read_priv(cx, buf.initialize_unfilled()))?;
		buf.advance(n);
		Poll::Ready(Ok(()))
	}
}

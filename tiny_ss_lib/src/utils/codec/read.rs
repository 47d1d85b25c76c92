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

use super::{
	faulted_err, Error, State, LENGTH_CHUNK_SIZE, LENGTH_MASK, MAX_PACKET_SIZE, OVERHEAD,
	PACKET_LENGTH_BUFFER_SIZE,
};
use crate::{
	prelude::*,
	utils::{
		crypto::aead::{nonce::CounterSequence, Cipher, Decryptor},
		poll_read_exact, read_u16,
	},
};
use futures::{future::poll_fn, ready};
use std::{
	io,
	task::{Context, Poll},
};
use tokio::io::ReadBuf;

/// Progress of the chunk being read from the inner reader.
#[derive(Debug, Clone, Copy)]
enum Progress {
	/// `pos` bytes of the sealed length are in the buffer.
	Length { pos: usize },
	/// `pos` bytes of the sealed payload of `len` bytes are in the buffer.
	Payload { len: usize, pos: usize },
}

/// A reader that takes chunks from another [`AsyncRead`] and opens them.
///
/// Decrypted bytes that do not fit into the caller's buffer are cached
/// and returned by later calls.
pub struct Reader<R> {
	r: R,
	dec: Decryptor,
	max_packet_size: usize,
	/// Backing store of the cache.
	/// Plain text of the last chunk is at `buf[index..index + cached]`.
	buf: Vec<u8>,
	index: usize,
	cached: usize,
	progress: Progress,
	state: State,
}

impl<R> Reader<R> {
	/// Create a new [`Reader`] with an all-zero nonce.
	///
	/// `max_packet_size` will be clamped into `1..=MAX_PACKET_SIZE`.
	pub fn new(r: R, cipher: Cipher, max_packet_size: usize) -> Self {
		let max_packet_size = max_packet_size.max(1).min(MAX_PACKET_SIZE);
		let buf_len = max_packet_size.max(PACKET_LENGTH_BUFFER_SIZE) + OVERHEAD;
		Self {
			r,
			dec: Decryptor::new(cipher),
			max_packet_size,
			buf: vec![0_u8; buf_len],
			index: 0,
			cached: 0,
			progress: Progress::Length { pos: 0 },
			state: State::Active,
		}
	}

	/// The whole backing store of the cache.
	///
	/// Only [`Reader::cached_slice`] contains meaningful data.
	#[inline]
	pub fn buffer(&self) -> &[u8] {
		&self.buf
	}

	/// Number of decrypted bytes that have not been read yet.
	#[inline]
	pub fn cached(&self) -> usize {
		self.cached
	}

	/// Decrypted bytes that have not been read yet.
	#[inline]
	pub fn cached_slice(&self) -> &[u8] {
		&self.buf[self.index..self.index + self.cached]
	}

	#[inline]
	pub fn nonce(&self) -> &CounterSequence {
		self.dec.nonce()
	}

	#[inline]
	pub fn state(&self) -> State {
		self.state
	}

	#[inline]
	pub fn get_ref(&self) -> &R {
		&self.r
	}

	#[inline]
	pub fn get_mut(&mut self) -> &mut R {
		&mut self.r
	}

	#[inline]
	pub fn into_inner(self) -> R {
		self.r
	}

	/// Open a complete sealed chunk (`cipher text | tag`) that did not come
	/// from the inner reader, and put its plain text into the cache.
	///
	/// Any previously cached bytes are dropped.
	///
	/// # Errors
	///
	/// Returns an error if `chunk` has an invalid size or fails authentication.
	pub fn read_external_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
		self.check_usable()?;
		if chunk.len() < OVERHEAD || chunk.len() > self.buf.len() {
			return self.fault_on_err(Err(Error::InvalidChunk(chunk.len()).into()));
		}
		self.buf[..chunk.len()].copy_from_slice(chunk);
		let res = self.open_payload(chunk.len() - OVERHEAD);
		self.fault_on_err(res.map_err(Into::into))
	}

	/// Open a complete sealed chunk and append its plain text into `target`.
	///
	/// The cache is left untouched.
	///
	/// # Errors
	///
	/// Returns an error if `chunk` has an invalid size or fails authentication.
	pub fn read_chunk(&mut self, target: &mut Vec<u8>, chunk: &[u8]) -> io::Result<()> {
		self.check_usable()?;
		if chunk.len() < OVERHEAD {
			return self.fault_on_err(Err(Error::InvalidChunk(chunk.len()).into()));
		}
		let pos = target.len();
		target.extend_from_slice(chunk);
		if let Err(e) = self.dec.open_inplace(&mut target[pos..], &[]) {
			target.truncate(pos);
			self.state = State::Faulted;
			return Err(Error::from(e).into());
		}
		target.truncate(target.len() - OVERHEAD);
		Ok(())
	}

	fn check_usable(&self) -> io::Result<()> {
		if self.state == State::Faulted {
			return Err(faulted_err("Reader"));
		}
		Ok(())
	}

	fn fault_on_err<T>(&mut self, res: io::Result<T>) -> io::Result<T> {
		if let Err(e) = &res {
			debug!("Reader faulted ({})", e);
			self.state = State::Faulted;
			self.cached = 0;
		}
		res
	}

	/// Move as many cached bytes as possible into `dst`.
	fn consume_cached(&mut self, dst: &mut [u8]) -> usize {
		let len = std::cmp::min(dst.len(), self.cached);
		dst[..len].copy_from_slice(&self.buf[self.index..self.index + len]);
		self.advance(len);
		len
	}

	fn advance(&mut self, len: usize) {
		debug_assert!(len <= self.cached);
		self.index += len;
		self.cached -= len;
	}

	/// Open the length chunk stored in `self.buf[..LENGTH_CHUNK_SIZE]`.
	fn open_length(&mut self) -> Result<usize, Error> {
		self.cached = 0;
		let plain = self
			.dec
			.open_inplace(&mut self.buf[..LENGTH_CHUNK_SIZE], &[])?;
		let len = usize::from(read_u16(plain) & LENGTH_MASK);
		let len = self.check_length(len)?;
		trace!("Opened chunk length {}", len);
		Ok(len)
	}

	/// Open the payload chunk stored in `self.buf[..len + OVERHEAD]` into cache.
	fn open_payload(&mut self, len: usize) -> Result<(), Error> {
		self.cached = 0;
		self.dec.open_inplace(&mut self.buf[..len + OVERHEAD], &[])?;
		self.index = 0;
		self.cached = len;
		trace!("Opened chunk payload ({} bytes)", len);
		Ok(())
	}

	/// Check the plain text length of a chunk.
	fn check_length(&self, len: usize) -> Result<usize, Error> {
		if len == 0 {
			return Err(Error::EmptyChunk);
		}
		if len > self.max_packet_size {
			return Err(Error::ChunkTooLarge {
				len,
				max: self.max_packet_size,
			});
		}
		Ok(len)
	}
}

impl<R> Reader<R>
where
	R: AsyncRead + Unpin,
{
	/// Read decrypted bytes into `dst`.
	///
	/// Returns `Ok(0)` if EOF is reached at a chunk boundary.
	///
	/// # Errors
	///
	/// IO errors are returned as is. EOF in the middle of a chunk is
	/// [`io::ErrorKind::UnexpectedEof`]. Framing and authentication errors
	/// are [`io::ErrorKind::InvalidData`] carrying an [`Error`].
	/// Any error puts the reader into [`State::Faulted`].
	pub async fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
		poll_fn(|cx| self.poll_read_slice(cx, dst)).await
	}

	/// Read a single decrypted byte.
	///
	/// # Errors
	///
	/// Returns [`io::ErrorKind::UnexpectedEof`] if EOF is reached,
	/// otherwise the same error as [`Reader::read`].
	pub async fn read_byte(&mut self) -> io::Result<u8> {
		let mut b = [0_u8; 1];
		if self.read(&mut b).await? == 0 {
			return Err(io::ErrorKind::UnexpectedEof.into());
		}
		Ok(b[0])
	}

	/// Fill the whole `dst` with decrypted bytes.
	///
	/// # Errors
	///
	/// Returns [`io::ErrorKind::UnexpectedEof`] if EOF is reached before `dst` is full,
	/// otherwise the same error as [`Reader::read`].
	pub async fn read_exact(&mut self, dst: &mut [u8]) -> io::Result<()> {
		let mut pos = 0;
		while pos < dst.len() {
			let n = self.read(&mut dst[pos..]).await?;
			if n == 0 {
				return Err(io::ErrorKind::UnexpectedEof.into());
			}
			pos += n;
		}
		Ok(())
	}

	/// Skip `n` decrypted bytes.
	///
	/// # Errors
	///
	/// Returns [`io::ErrorKind::UnexpectedEof`] if EOF is reached before
	/// `n` bytes are skipped, otherwise the same error as [`Reader::read`].
	pub async fn discard(&mut self, mut n: usize) -> io::Result<()> {
		self.check_usable()?;
		while n > 0 {
			if self.cached == 0 && !self.next_chunk().await? {
				return Err(io::Error::new(
					io::ErrorKind::UnexpectedEof,
					format!("EOF with {} bytes left to discard", n),
				));
			}
			let len = std::cmp::min(n, self.cached);
			self.advance(len);
			n -= len;
		}
		Ok(())
	}

	/// Write all remaining decrypted bytes into `w` until EOF,
	/// then flush `w`.
	///
	/// Returns the number of bytes written.
	///
	/// # Errors
	///
	/// Returns the error of either this reader or `w`.
	pub async fn write_to<W>(&mut self, w: &mut W) -> io::Result<u64>
	where
		W: AsyncWrite + Unpin,
	{
		self.check_usable()?;
		let mut total = 0_u64;
		loop {
			if self.cached == 0 && !self.next_chunk().await? {
				break;
			}
			let len = self.cached;
			w.write_all(self.cached_slice()).await?;
			self.advance(len);
			total += len as u64;
		}
		w.flush().await?;
		Ok(total)
	}

	/// Continue reading a chunk whose sealed length part (`length_chunk`,
	/// [`LENGTH_CHUNK_SIZE`] bytes) has already been taken from the inner reader.
	///
	/// The payload is read from the inner reader into the cache.
	/// Any previously cached bytes are dropped.
	///
	/// # Errors
	///
	/// Returns the same error as [`Reader::read`].
	pub async fn read_with_length_chunk(&mut self, length_chunk: &[u8]) -> io::Result<()> {
		self.check_usable()?;
		if length_chunk.len() != LENGTH_CHUNK_SIZE {
			return self.fault_on_err(Err(Error::InvalidChunk(length_chunk.len()).into()));
		}
		self.buf[..LENGTH_CHUNK_SIZE].copy_from_slice(length_chunk);
		let len = self.open_length().map_err(io::Error::from);
		let len = self.fault_on_err(len)?;
		self.read_payload(len).await
	}

	/// Read a payload of `len` bytes from the inner reader into the cache.
	///
	/// The length part must have been consumed already,
	/// with the nonce advanced accordingly.
	/// Any previously cached bytes are dropped.
	///
	/// # Errors
	///
	/// Returns the same error as [`Reader::read`].
	pub async fn read_with_length(&mut self, len: u16) -> io::Result<()> {
		self.check_usable()?;
		let len = self.check_length(usize::from(len)).map_err(io::Error::from);
		let len = self.fault_on_err(len)?;
		self.cached = 0;
		self.read_payload(len).await
	}

	async fn next_chunk(&mut self) -> io::Result<bool> {
		poll_fn(|cx| self.poll_next_chunk(cx)).await
	}

	async fn read_payload(&mut self, len: usize) -> io::Result<()> {
		self.progress = Progress::Payload { len, pos: 0 };
		let res = poll_fn(|cx| self.poll_progress(cx)).await.map(|_| ());
		self.fault_on_err(res)
	}

	fn poll_read_slice(
		&mut self,
		cx: &mut Context<'_>,
		dst: &mut [u8],
	) -> Poll<io::Result<usize>> {
		self.check_usable()?;
		if dst.is_empty() {
			return Poll::Ready(Ok(0));
		}
		if self.cached == 0 && !ready!(self.poll_next_chunk(cx))? {
			return Poll::Ready(Ok(0));
		}
		Poll::Ready(Ok(self.consume_cached(dst)))
	}

	/// Read and open the next chunk into cache.
	///
	/// Returns `Ok(false)` on EOF.
	fn poll_next_chunk(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<bool>> {
		match self.state {
			State::Faulted => return Poll::Ready(Err(faulted_err("Reader"))),
			State::Closed => return Poll::Ready(Ok(false)),
			State::Active => {}
		}
		let res = ready!(self.poll_progress(cx));
		if let Ok(false) = res {
			trace!("Reader reached EOF");
			self.state = State::Closed;
		}
		Poll::Ready(self.fault_on_err(res))
	}

	/// Drive the chunk in progress until its payload is opened.
	///
	/// Returns `Ok(false)` if EOF is reached before any byte of the chunk.
	fn poll_progress(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<bool>> {
		loop {
			match &mut self.progress {
				Progress::Length { pos } => {
					let n = ready!(poll_read_exact(
						Pin::new(&mut self.r),
						cx,
						&mut self.buf[..LENGTH_CHUNK_SIZE],
						pos
					))?;
					if n == 0 {
						return Poll::Ready(Ok(false));
					}
					let len = self.open_length()?;
					self.progress = Progress::Payload { len, pos: 0 };
				}
				Progress::Payload { len, pos } => {
					let len = *len;
					let chunk_len = len + OVERHEAD;
					let n = ready!(poll_read_exact(
						Pin::new(&mut self.r),
						cx,
						&mut self.buf[..chunk_len],
						pos
					))?;
					if n == 0 {
						return Poll::Ready(Err(io::Error::new(
							io::ErrorKind::UnexpectedEof,
							format!("EOF while reading chunk payload ({} bytes)", chunk_len),
						)));
					}
					self.progress = Progress::Length { pos: 0 };
					self.open_payload(len)?;
					return Poll::Ready(Ok(true));
				}
			}
		}
	}
}

impl<R> AsyncRead for Reader<R>
where
	R: AsyncRead + Unpin,
{
	fn poll_read(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<io::Result<()>> {
		let me = self.get_mut();
		let n = ready!(me.poll_read_slice(cx, buf.initialize_unfilled()))?;
		buf.advance(n);
		Poll::Ready(Ok(()))
	}
}

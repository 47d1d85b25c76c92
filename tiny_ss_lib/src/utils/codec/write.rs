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

use super::{faulted_err, Error, State, LENGTH_CHUNK_SIZE, MAX_PACKET_SIZE, OVERHEAD};
use crate::{
	prelude::*,
	utils::{
		append_mut, append_u16_mut,
		crypto::aead::{nonce::CounterSequence, Cipher, Encryptor},
		poll_write_all,
	},
};
use futures::{future::poll_fn, ready};
use std::{
	io,
	task::{Context, Poll},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Progress {
	/// Nothing is waiting in the buffer.
	Encoding,
	/// `buf[pos..]` is still to be written, sealed from `consumed` plain bytes.
	Writing { pos: usize, consumed: usize },
}

/// A writer that seals bytes into chunks and writes them into another [`AsyncWrite`].
///
/// Every call to [`Writer::write`] consumes the whole input, splitting
/// it into chunks of at most `max_packet_size` bytes.
///
/// As an [`AsyncWrite`], each `poll_write` seals and writes at most one chunk.
pub struct Writer<W> {
	w: W,
	enc: Encryptor,
	max_packet_size: usize,
	buf: Vec<u8>,
	progress: Progress,
	state: State,
}

impl<W> Writer<W> {
	/// Create a new [`Writer`] with an all-zero nonce.
	///
	/// `max_packet_size` will be clamped into `1..=MAX_PACKET_SIZE`.
	pub fn new(w: W, cipher: Cipher, max_packet_size: usize) -> Self {
		let max_packet_size = clamp_packet_size(max_packet_size);
		Self {
			w,
			enc: Encryptor::new(cipher),
			max_packet_size,
			buf: Vec::with_capacity(max_packet_size + LENGTH_CHUNK_SIZE + OVERHEAD),
			progress: Progress::Encoding,
			state: State::Active,
		}
	}

	/// Create a new [`Writer`] reusing `buffer` as scratch space
	/// and continuing from `nonce`.
	///
	/// Existing content of `buffer` is discarded.
	///
	/// # Errors
	///
	/// Returns an error if the length of `nonce` does not fit `cipher`.
	pub fn new_raw(
		w: W,
		cipher: Cipher,
		max_packet_size: usize,
		mut buffer: Vec<u8>,
		nonce: CounterSequence,
	) -> Result<Self, Error> {
		buffer.clear();
		Ok(Self {
			w,
			enc: Encryptor::with_nonce(cipher, nonce)?,
			max_packet_size: clamp_packet_size(max_packet_size),
			buf: buffer,
			progress: Progress::Encoding,
			state: State::Active,
		})
	}

	/// Seal `chunk` as a single AEAD message and append it into `target`,
	/// without any length prefix.
	///
	/// Nonce is advanced exactly like a normal seal.
	///
	/// # Errors
	///
	/// Returns an error if the writer is faulted or sealing failed.
	pub fn write_chunk(&mut self, target: &mut Vec<u8>, chunk: &[u8]) -> io::Result<()> {
		if self.state != State::Active {
			return Err(faulted_err("Writer"));
		}
		let pos = target.len();
		target.reserve(chunk.len() + OVERHEAD);
		target.extend_from_slice(chunk);
		if let Err(e) = self.enc.seal_inplace_append_tag(pos, target, &[]) {
			target.truncate(pos);
			self.state = State::Faulted;
			return Err(Error::from(e).into());
		}
		Ok(())
	}

	/// Seal `src` into length-prefixed chunks like [`Writer::write`],
	/// but append them into `target` instead of the inner writer.
	///
	/// # Errors
	///
	/// Returns an error if the writer is faulted or sealing failed.
	pub fn seal_into(&mut self, target: &mut Vec<u8>, src: &[u8]) -> io::Result<()> {
		if self.state != State::Active {
			return Err(faulted_err("Writer"));
		}
		for chunk in src.chunks(self.max_packet_size) {
			if let Err(e) = encode_chunk(&mut self.enc, chunk, target) {
				self.state = State::Faulted;
				return Err(e.into());
			}
		}
		Ok(())
	}

	/// Consume the writer and hand its nonce over to the caller,
	/// so that another writer can continue the same nonce sequence
	/// with [`Writer::new_raw`].
	#[must_use]
	pub fn take_nonce(self) -> CounterSequence {
		self.enc.into_parts().1
	}

	#[inline]
	pub fn nonce(&self) -> &CounterSequence {
		self.enc.nonce()
	}

	#[inline]
	pub fn state(&self) -> State {
		self.state
	}

	#[inline]
	pub fn max_packet_size(&self) -> usize {
		self.max_packet_size
	}

	#[inline]
	pub fn get_ref(&self) -> &W {
		&self.w
	}

	#[inline]
	pub fn get_mut(&mut self) -> &mut W {
		&mut self.w
	}

	#[inline]
	pub fn into_inner(self) -> W {
		self.w
	}
}

impl<W> Writer<W>
where
	W: AsyncWrite + Unpin,
{
	/// Seal all bytes of `src` and write them into the inner writer.
	///
	/// Each chunk (length and payload) is written with a single `write_all`.
	/// Returns `src.len()` on success.
	///
	/// # Errors
	///
	/// Any error will put the writer into [`State::Faulted`].
	pub async fn write(&mut self, src: &[u8]) -> io::Result<usize> {
		if self.state != State::Active {
			return Err(faulted_err("Writer"));
		}
		let mut pos = 0;
		while pos < src.len() {
			let n = poll_fn(|cx| self.poll_write_chunk(cx, &src[pos..])).await?;
			pos += n;
		}
		Ok(src.len())
	}

	/// Seal at most one chunk from the front of `src` and write it.
	///
	/// Returns the number of plain bytes sealed.
	fn poll_write_chunk(
		&mut self,
		cx: &mut Context<'_>,
		src: &[u8],
	) -> Poll<io::Result<usize>> {
		if self.state != State::Active {
			return Poll::Ready(Err(faulted_err("Writer")));
		}
		loop {
			match &mut self.progress {
				Progress::Encoding => {
					if src.is_empty() {
						return Poll::Ready(Ok(0));
					}
					let chunk = &src[..src.len().min(self.max_packet_size)];
					self.buf.clear();
					if let Err(e) = encode_chunk(&mut self.enc, chunk, &mut self.buf) {
						self.state = State::Faulted;
						return Poll::Ready(Err(e.into()));
					}
					trace!(
						"Sealed chunk of {} bytes into {} bytes",
						chunk.len(),
						self.buf.len()
					);
					self.progress = Progress::Writing {
						pos: 0,
						consumed: chunk.len(),
					};
				}
				Progress::Writing { pos, consumed } => {
					let consumed = *consumed;
					let res = ready!(poll_write_all(Pin::new(&mut self.w), cx, pos, &self.buf));
					if let Err(e) = res {
						debug!("Error occurred while writing chunk ({})", e);
						self.state = State::Faulted;
						return Poll::Ready(Err(e));
					}
					self.progress = Progress::Encoding;
					return Poll::Ready(Ok(consumed));
				}
			}
		}
	}
}

impl<W> AsyncWrite for Writer<W>
where
	W: AsyncWrite + Unpin,
{
	fn poll_write(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		src: &[u8],
	) -> Poll<io::Result<usize>> {
		self.get_mut().poll_write_chunk(cx, src)
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Pin::new(&mut self.get_mut().w).poll_flush(cx)
	}

	/// Shut down the inner writer. No more chunks can be written after this.
	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		let me = self.get_mut();
		if me.state == State::Active {
			me.state = State::Closed;
		}
		Pin::new(&mut me.w).poll_shutdown(cx)
	}
}

#[inline]
fn clamp_packet_size(size: usize) -> usize {
	size.max(1).min(MAX_PACKET_SIZE)
}

/// Append the sealed length and sealed payload of `src` into `buf`.
fn encode_chunk(enc: &mut Encryptor, src: &[u8], buf: &mut Vec<u8>) -> Result<(), Error> {
	let src_len = u16::try_from(src.len())
		.ok()
		.filter(|len| usize::from(*len) <= MAX_PACKET_SIZE)
		.ok_or(Error::ChunkTooLarge {
			len: src.len(),
			max: MAX_PACKET_SIZE,
		})?;
	if src_len == 0 {
		return Err(Error::EmptyChunk);
	}

	// Reserve for src.
	// DO NOT clean up buffer.
	buf.reserve(LENGTH_CHUNK_SIZE + src.len() + OVERHEAD);
	{
		// Payload length.
		// 2 + TAG_LEN bytes.
		let len_buf = append_u16_mut(buf, src_len);
		let tag = enc.seal_inplace(len_buf, &[])?;
		buf.put_slice(&tag);
	}
	{
		// Payload.
		// src.len() + TAG_LEN bytes.
		let payload_buf = append_mut(buf, src);
		let tag = enc.seal_inplace(payload_buf, &[])?;
		buf.put_slice(&tag);
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::{super::test_utils::new_test_cipher, *};
	use crate::utils::crypto::aead::{Decryptor, TAG_LEN};

	#[test]
	fn test_write_frames() {
		let cipher = new_test_cipher();
		let rt = tokio::runtime::Runtime::new().unwrap();
		rt.block_on(async {
			let plain = vec![5_u8; MAX_PACKET_SIZE + 10];
			let mut writer = Writer::new(Vec::new(), cipher.clone(), MAX_PACKET_SIZE);
			assert_eq!(writer.write(&plain).await.unwrap(), plain.len());
			let data = writer.into_inner();
			// Two chunks.
			assert_eq!(data.len(), 2 * (LENGTH_CHUNK_SIZE + OVERHEAD) + plain.len());

			// Open manually.
			let mut data = data;
			let mut dec = Decryptor::new(cipher);
			let (len_part, rest) = data.split_at_mut(LENGTH_CHUNK_SIZE);
			let len = crate::utils::read_u16(dec.open_inplace(len_part, &[]).unwrap());
			assert_eq!(usize::from(len), MAX_PACKET_SIZE);
			let payload = dec
				.open_inplace(&mut rest[..MAX_PACKET_SIZE + TAG_LEN], &[])
				.unwrap();
			assert!(payload.iter().all(|b| *b == 5));
		});
	}

	#[test]
	fn test_write_empty() {
		let rt = tokio::runtime::Runtime::new().unwrap();
		rt.block_on(async {
			let mut writer = Writer::new(Vec::new(), new_test_cipher(), MAX_PACKET_SIZE);
			assert_eq!(writer.write(&[]).await.unwrap(), 0);
			assert!(writer.get_ref().is_empty());
			assert_eq!(writer.nonce(), &CounterSequence::new(12));
		});
	}

	#[test]
	fn test_small_packet_size() {
		let rt = tokio::runtime::Runtime::new().unwrap();
		rt.block_on(async {
			let mut writer = Writer::new(Vec::new(), new_test_cipher(), 4);
			writer.write(b"0123456789").await.unwrap();
			// 3 chunks: 4 + 4 + 2 bytes.
			assert_eq!(writer.get_ref().len(), 3 * (LENGTH_CHUNK_SIZE + OVERHEAD) + 10);
			let mut expected = CounterSequence::new(12);
			for _ in 0..6 {
				expected.update();
			}
			assert_eq!(writer.nonce(), &expected);
		});
	}

	#[test]
	fn test_new_raw() {
		let cipher = new_test_cipher();
		let buffer = Vec::with_capacity(MAX_PACKET_SIZE + LENGTH_CHUNK_SIZE + OVERHEAD);
		let capacity = buffer.capacity();
		let mut nonce = CounterSequence::new(12);
		nonce.update();
		let writer =
			Writer::new_raw(Vec::<u8>::new(), cipher.clone(), MAX_PACKET_SIZE, buffer, nonce.clone())
				.unwrap();
		assert_eq!(writer.nonce(), &nonce);
		assert_eq!(writer.buf.capacity(), capacity);

		assert!(Writer::new_raw(
			Vec::<u8>::new(),
			cipher,
			MAX_PACKET_SIZE,
			Vec::new(),
			CounterSequence::new(24)
		)
		.is_err());
	}

	#[test]
	fn test_take_nonce_continues_sequence() {
		let cipher = new_test_cipher();
		let rt = tokio::runtime::Runtime::new().unwrap();
		rt.block_on(async {
			// One writer for everything.
			let mut single = Writer::new(Vec::new(), cipher.clone(), MAX_PACKET_SIZE);
			single.write(b"header").await.unwrap();
			single.write(b"payload").await.unwrap();
			let expected = single.into_inner();

			// Two writers sharing one nonce sequence.
			let mut first = Writer::new(Vec::new(), cipher.clone(), MAX_PACKET_SIZE);
			first.write(b"header").await.unwrap();
			let buf = first.get_ref().clone();
			let nonce = first.take_nonce();
			let mut second =
				Writer::new_raw(buf, cipher, MAX_PACKET_SIZE, Vec::new(), nonce).unwrap();
			second.write(b"payload").await.unwrap();

			assert_eq!(second.into_inner(), expected);
		});
	}

	#[test]
	fn test_seal_into() {
		let cipher = new_test_cipher();
		let rt = tokio::runtime::Runtime::new().unwrap();
		rt.block_on(async {
			let plain = vec![7_u8; MAX_PACKET_SIZE + 1];
			let mut expected = Writer::new(Vec::new(), cipher.clone(), MAX_PACKET_SIZE);
			expected.write(&plain).await.unwrap();

			let mut writer = Writer::new(tokio::io::sink(), cipher, MAX_PACKET_SIZE);
			let mut target = b"salt".to_vec();
			writer.seal_into(&mut target, &plain).unwrap();
			assert_eq!(&target[..4], b"salt");
			assert_eq!(&target[4..], expected.get_ref().as_slice());
			assert_eq!(writer.nonce(), expected.nonce());
		});
	}

	#[test]
	fn test_write_chunk() {
		let cipher = new_test_cipher();
		let mut writer = Writer::new(Vec::<u8>::new(), cipher.clone(), MAX_PACKET_SIZE);
		let mut target = vec![1_u8, 2, 3];
		writer.write_chunk(&mut target, b"chunk data").unwrap();
		assert_eq!(target.len(), 3 + 10 + OVERHEAD);
		assert_eq!(&target[..3], &[1, 2, 3]);

		let mut dec = Decryptor::new(cipher);
		assert_eq!(dec.open_inplace(&mut target[3..], &[]).unwrap(), b"chunk data");
		assert_eq!(writer.nonce(), dec.nonce());
	}

	#[test]
	fn test_async_write() {
		let cipher = new_test_cipher();
		let rt = tokio::runtime::Runtime::new().unwrap();
		rt.block_on(async {
			let mut writer = Writer::new(Vec::new(), cipher.clone(), 4);
			// A single poll seals one chunk only.
			assert_eq!(AsyncWriteExt::write(&mut writer, b"0123456789").await.unwrap(), 4);
			AsyncWriteExt::write_all(&mut writer, b"456789").await.unwrap();
			writer.flush().await.unwrap();
			writer.shutdown().await.unwrap();
			assert_eq!(writer.state(), State::Closed);
			assert_eq!(
				writer.write(b"more").await.unwrap_err().kind(),
				io::ErrorKind::BrokenPipe
			);

			let mut expected = Writer::new(Vec::new(), cipher, 4);
			expected.write(b"0123456789").await.unwrap();
			assert_eq!(writer.into_inner(), expected.into_inner());
		});
	}

	#[test]
	fn test_faulted_after_io_error() {
		struct BrokenWriter;

		impl AsyncWrite for BrokenWriter {
			fn poll_write(
				self: Pin<&mut Self>,
				_cx: &mut std::task::Context<'_>,
				_buf: &[u8],
			) -> std::task::Poll<io::Result<usize>> {
				std::task::Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()))
			}

			fn poll_flush(
				self: Pin<&mut Self>,
				_cx: &mut std::task::Context<'_>,
			) -> std::task::Poll<io::Result<()>> {
				std::task::Poll::Ready(Ok(()))
			}

			fn poll_shutdown(
				self: Pin<&mut Self>,
				_cx: &mut std::task::Context<'_>,
			) -> std::task::Poll<io::Result<()>> {
				std::task::Poll::Ready(Ok(()))
			}
		}

		let rt = tokio::runtime::Runtime::new().unwrap();
		rt.block_on(async {
			let mut writer = Writer::new(BrokenWriter, new_test_cipher(), MAX_PACKET_SIZE);
			let e = writer.write(b"data").await.unwrap_err();
			assert_eq!(e.kind(), io::ErrorKind::ConnectionReset);
			assert_eq!(writer.state(), State::Faulted);
			let e = writer.write(b"data").await.unwrap_err();
			assert_eq!(e.kind(), io::ErrorKind::BrokenPipe);
		});
	}
}

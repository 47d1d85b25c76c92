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

use futures::ready;
use std::{
	io,
	pin::Pin,
	task::{Context, Poll},
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Poll read exactly `dst.len()` bytes into `dst`, starting from `pos`.
///
/// Returns `Ok(0)` if EOF is reached before any byte is read,
/// otherwise `Ok(dst.len())` when `dst` is full.
///
/// Returns `Err(UnexpectedEof)` if EOF is reached when there are some
/// bytes read into `dst` but it is not full.
pub fn poll_read_exact<R>(
	mut reader: Pin<&mut R>,
	cx: &mut Context<'_>,
	dst: &mut [u8],
	pos: &mut usize,
) -> Poll<io::Result<usize>>
where
	R: AsyncRead,
{
	while *pos < dst.len() {
		let mut buf = ReadBuf::new(&mut dst[*pos..]);
		ready!(reader.as_mut().poll_read(cx, &mut buf))?;
		let n = buf.filled().len();
		if n == 0 {
			if *pos == 0 {
				return Poll::Ready(Ok(0));
			}
			return Poll::Ready(Err(io::Error::new(
				io::ErrorKind::UnexpectedEof,
				format!("EOF after {} of {} bytes", *pos, dst.len()),
			)));
		}
		*pos += n;
	}
	Poll::Ready(Ok(dst.len()))
}

/// Poll write all of `src[*pos..]` into `writer`.
///
/// `pos` is advanced as bytes are written, so polling again after
/// `Poll::Pending` continues where it stopped.
pub fn poll_write_all<W>(
	mut writer: Pin<&mut W>,
	cx: &mut Context<'_>,
	pos: &mut usize,
	src: &[u8],
) -> Poll<io::Result<()>>
where
	W: AsyncWrite,
{
	debug_assert!(*pos <= src.len());
	while *pos < src.len() {
		let n = ready!(writer.as_mut().poll_write(cx, &src[*pos..]))?;
		if n == 0 {
			return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
		}
		*pos += n;
	}
	Poll::Ready(Ok(()))
}

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

use crate::prelude::*;
use futures::{
	future::{self, Either},
	Future,
};
use std::{io, time::Duration};
use tokio::{
	io::{AsyncBufRead, AsyncBufReadExt, BufReader},
	time::timeout,
};

/// How long the other direction may keep going after one direction finished.
const OTHER_TASK_TIMEOUT: Duration = Duration::from_millis(2000);

/// Copy bytes between a local plain stream (`local_r`, `local_w`) and
/// a remote stream (`remote_r`, `remote_w`), each direction with its own
/// buffer of `buffer_size` bytes.
///
/// Each write side is shut down when the read side of the same direction
/// reaches EOF.
///
/// Returns the number of bytes sent and received.
///
/// # Errors
///
/// Returns the first error of either direction, or [`io::ErrorKind::TimedOut`]
/// if the other direction cannot finish in time after one direction is done.
pub async fn relay_stream<LR, LW, RR, RW>(
	local_r: LR,
	local_w: LW,
	remote_r: RR,
	remote_w: RW,
	buffer_size: usize,
) -> io::Result<(u64, u64)>
where
	LR: AsyncRead + Unpin,
	LW: AsyncWrite + Unpin,
	RR: AsyncRead + Unpin,
	RW: AsyncWrite + Unpin,
{
	let buffer_size = buffer_size.max(1);

	// Local ---> Remote
	let send_task = copy_stream(
		"[send]",
		BufReader::with_capacity(buffer_size, local_r),
		remote_w,
	);
	// Local <--- Remote
	let recv_task = copy_stream(
		"[recv]",
		BufReader::with_capacity(buffer_size, remote_r),
		local_w,
	);
	futures::pin_mut!(send_task);
	futures::pin_mut!(recv_task);

	match future::select(send_task, recv_task).await {
		Either::Left((send_res, recv_task)) => {
			let sent = send_res?;
			trace!("[send] task finished with {} bytes", sent);
			let recv = handle_other_task("[recv]", recv_task).await?;
			Ok((sent, recv))
		}
		Either::Right((recv_res, send_task)) => {
			let recv = recv_res?;
			trace!("[recv] task finished with {} bytes", recv);
			let sent = handle_other_task("[send]", send_task).await?;
			Ok((sent, recv))
		}
	}
}

/// Wait for the remaining task, but not longer than [`OTHER_TASK_TIMEOUT`].
async fn handle_other_task<F>(tag: &str, task: F) -> io::Result<u64>
where
	F: Future<Output = io::Result<u64>>,
{
	if let Ok(res) = timeout(OTHER_TASK_TIMEOUT, task).await {
		res
	} else {
		debug!(
			"{} task cannot finish in {} ms after the other one",
			tag,
			OTHER_TASK_TIMEOUT.as_millis()
		);
		Err(io::Error::new(
			io::ErrorKind::TimedOut,
			format!("{} task timed out", tag),
		))
	}
}

/// Copy bytes from `r` to `w` until EOF, then shut down `w`.
async fn copy_stream<R, W>(tag: &str, mut r: R, mut w: W) -> io::Result<u64>
where
	R: AsyncBufRead + Unpin,
	W: AsyncWrite + Unpin,
{
	let mut count = 0_u64;
	loop {
		let data = r.fill_buf().await?;
		if data.is_empty() {
			debug!("{} read half reach EOF, shutting down write half", tag);
			w.shutdown().await?;
			return Ok(count);
		}
		let n = w.write(data).await?;
		if n == 0 {
			return Err(io::ErrorKind::WriteZero.into());
		}
		r.consume(n);
		count += n as u64;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::proxy::shadowsocks::{password_to_key, test_utils, Dialer};
	use tokio::io::duplex;

	#[test]
	fn test_relay_stream() {
		let in_data: Vec<u8> = (0..5000_u32).map(|i| (i % 251) as u8).collect();
		let out_data: Vec<u8> = (0..3000_u32).map(|i| (i % 241) as u8).collect();
		let dialer = Dialer::new("chacha20-ietf-poly1305", "password").unwrap();
		let key = password_to_key(32, "password");
		let dst = SocksAddr::from_str("example.com:80").unwrap();

		let rt = tokio::runtime::Runtime::new().unwrap();
		rt.block_on(async {
			let response = test_utils::encode_response(dialer.method(), &key, &out_data).await;
			let (client, mut server) = duplex(64 * 1024);
			server.write_all(&response).await.unwrap();
			server.shutdown().await.unwrap();

			let (remote_r, remote_w) = dialer.dial_early_conn(client, dst.clone()).into_split();
			let mut local_result = Vec::new();
			let (sent, recv) = relay_stream(
				in_data.as_slice(),
				&mut local_result,
				remote_r,
				remote_w,
				1024,
			)
			.await
			.unwrap();
			assert_eq!(sent, in_data.len() as u64);
			assert_eq!(recv, out_data.len() as u64);
			assert_eq!(local_result, out_data);

			let mut raw = Vec::new();
			server.read_to_end(&mut raw).await.unwrap();
			let (_, plain) = test_utils::decode_request(dialer.method(), &key, &raw).await;
			let mut expected = Vec::new();
			dst.write_to(&mut expected);
			expected.extend_from_slice(&in_data);
			assert_eq!(plain, expected);
		});
	}

	#[test]
	fn test_other_task_timeout() {
		let dialer = Dialer::new("aes-128-gcm", "password").unwrap();
		let dst = SocksAddr::from_str("example.com:80").unwrap();

		let rt = tokio::runtime::Runtime::new().unwrap();
		rt.block_on(async {
			// Server keeps the connection open without ever responding.
			let (client, _server) = duplex(1024);
			let (remote_r, remote_w) = dialer.dial_early_conn(client, dst).into_split();
			let mut local_result = Vec::new();
			let e = relay_stream(&b""[..], &mut local_result, remote_r, remote_w, 1024)
				.await
				.unwrap_err();
			assert_eq!(e.kind(), io::ErrorKind::TimedOut);
			assert!(local_result.is_empty());
		});
	}
}

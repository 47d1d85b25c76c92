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
A local TCP tunnel.

Every accepted connection is forwarded through a new Shadowsocks
connection to the destination in [`Settings`].
*/

use crate::{
	prelude::*,
	proxy::shadowsocks::{Error, Settings},
	utils::relay::relay_stream,
};
use std::{io, time::Duration};
use tokio::net::{TcpListener, TcpStream};

const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(100);

pub struct Tunnel {
	settings: Arc<Settings>,
}

impl Tunnel {
	#[must_use]
	pub fn new(settings: Settings) -> Self {
		Self {
			settings: Arc::new(settings),
		}
	}

	#[inline]
	#[must_use]
	pub fn settings(&self) -> &Settings {
		&self.settings
	}

	/// Listen on `addr` and serve forever.
	///
	/// # Errors
	///
	/// Returns an error if `addr` cannot be bound.
	/// Errors of each connection are only logged.
	pub async fn serve(&self, addr: SocketAddr) -> io::Result<()> {
		let listener = TcpListener::bind(addr).await?;
		self.serve_listener(listener).await
	}

	/// Accept connections from `listener` and serve forever.
	///
	/// # Errors
	///
	/// Returns an error if the local address of `listener` cannot be read.
	/// Errors of each connection are only logged.
	pub async fn serve_listener(&self, listener: TcpListener) -> io::Result<()> {
		info!(
			"Serving tunnel on {} to {} through {}",
			listener.local_addr()?,
			self.settings.dst(),
			self.settings.server()
		);
		loop {
			let (stream, peer) = match listener.accept().await {
				Ok(res) => res,
				Err(e) => {
					warn!("Cannot accept connection ({})", e);
					tokio::time::sleep(ACCEPT_ERROR_DELAY).await;
					continue;
				}
			};
			let settings = self.settings.clone();
			tokio::spawn(async move {
				if let Err(e) = handle_connection(stream, peer, &settings).await {
					warn!("[{}] connection error ({})", peer, e);
				}
			});
		}
	}
}

async fn handle_connection(
	stream: TcpStream,
	peer: SocketAddr,
	settings: &Settings,
) -> Result<(), Error> {
	debug!("[{}] accepted", peer);
	let (remote_r, remote_w) = settings.connect().await?.into_split();
	let (r, w) = stream.into_split();
	let (sent, recv) = relay_stream(r, w, remote_r, remote_w, settings.buffer_size()).await?;
	info!(
		"[{}] connection closed, {} bytes sent, {} bytes received",
		peer, sent, recv
	);
	Ok(())
}

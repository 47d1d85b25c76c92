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

#![deny(clippy::all)]
#![warn(clippy::pedantic)]

mod args;
mod config;

use args::{Action, AppOptions, ServeAction};
use config::Config;
use std::{borrow::Cow, io};
use tiny_ss_lib::Tunnel;
use tokio::runtime::Runtime;

type BoxStdErr = Box<dyn std::error::Error + Send + Sync>;

const VERSION: &str = env!("CARGO_PKG_VERSION");

// Exit codes from sysexits.h
const EXIT_USAGE: i32 = 64;
const EXIT_SOFTWARE: i32 = 70;
const EXIT_IOERR: i32 = 74;
const EXIT_CONFIG: i32 = 78;

#[derive(Debug, thiserror::Error)]
enum Error {
	#[error("[IO error] {0}")]
	Io(#[from] io::Error),
	#[error("[input] {0}")]
	Input(Cow<'static, str>),
	#[error("[config] {0}")]
	Config(BoxStdErr),
	#[error("[runtime] {0}")]
	Runtime(BoxStdErr),
}

fn make_config(action: ServeAction) -> Result<Config, Error> {
	let conf_str = std::fs::read_to_string(&action.path).map_err(|e| {
		Error::Input(format!("cannot read config file '{}' ({})", action.path.display(), e).into())
	})?;
	let mut conf = Config::from_str(action.format, &conf_str).map_err(Error::Config)?;
	if let Some(level) = action.log {
		conf.log.level = level;
	}
	if let Some(output) = action.log_out {
		conf.log.output = output;
	}
	Ok(conf)
}

fn serve(action: ServeAction) -> Result<(), Error> {
	let conf = make_config(action)?;
	conf.log.init_logger().map_err(Error::Config)?;

	let settings = conf
		.shadowsocks
		.build()
		.map_err(|e| Error::Config(Box::new(e)))?;
	let tunnel = Tunnel::new(settings);

	let rt = Runtime::new()?;
	rt.block_on(tunnel.serve(conf.listen))
		.map_err(|e| Error::Runtime(Box::new(e)))
}

fn main() {
	let action = match AppOptions::new_from_args().into_action() {
		Ok(action) => action,
		Err(err) => {
			println!("Invalid arguments: {}", err);
			std::process::exit(EXIT_USAGE);
		}
	};
	let action = match action {
		Action::CheckVersion => {
			println!("{}", VERSION);
			return;
		}
		Action::Serve(action) => action,
	};
	if let Err(err) = serve(action) {
		println!("Error happened during initialization:\n {}\n", err);
		std::process::exit(match err {
			Error::Io(_) => EXIT_IOERR,
			Error::Input(_) | Error::Config(_) => EXIT_CONFIG,
			Error::Runtime(_) => EXIT_SOFTWARE,
		});
	}
}

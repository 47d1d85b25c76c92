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
	config::{Format, LogOutput},
	BoxStdErr,
};
use clap::{CommandFactory, Parser};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "tiny_ss")]
pub struct AppOptions {
	/// Set the format of the config file. Can be 'json' (default) or 'toml'.
	#[arg(short, long)]
	format: Option<Format>,

	/// Read config from file.
	#[arg(short, long, value_name = "FILE")]
	config: Option<String>,

	/// Print version.
	#[arg(long)]
	version: bool,

	/// Set the log level. Must be one of ["trace", "debug", "info", "warn", "error", "off"]
	#[arg(long, value_name = "LEVEL")]
	log: Option<log::LevelFilter>,

	/// Set the output for log. Can be '@stdout', '@stderr', '@none' or a file path.
	#[arg(long, value_name = "OUTPUT")]
	log_out: Option<String>,
}

impl AppOptions {
	pub fn new_from_args() -> Self {
		Self::parse()
	}

	pub fn into_action(self) -> Result<Action, BoxStdErr> {
		if self.version {
			return Ok(Action::CheckVersion);
		}

		if let Some(path) = self.config {
			let path = PathBuf::from(path);
			let format = self.format.unwrap_or_else(|| {
				let mut format = Format::default();
				if let Some(ext) = path.extension() {
					if ext.eq_ignore_ascii_case("toml") {
						format = Format::Toml;
					}
				}
				format
			});
			return Ok(Action::Serve(ServeAction {
				path,
				format,
				log: self.log,
				log_out: self.log_out.as_deref().map(LogOutput::from_str),
			}));
		}

		let mut cmd = Self::command();
		cmd.print_help()?;
		std::process::exit(1);
	}
}

pub enum Action {
	CheckVersion,
	Serve(ServeAction),
}

pub struct ServeAction {
	pub path: PathBuf,
	pub format: Format,
	/// Overrides the level in config file.
	pub log: Option<log::LevelFilter>,
	/// Overrides the output in config file.
	/// `Some(None)` disables logging.
	pub log_out: Option<Option<LogOutput>>,
}

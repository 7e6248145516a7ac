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


use super::config::{Config, LogOutput, Mode, ServerSettings};
use crate::BoxStdErr;
use clap::{CommandFactory, Parser, Subcommand};
use muxlink_lib::{
	protocol::{ClientType, ProxyProto},
	ClientSettings,
};

#[cfg(feature = "parse-config")]
use super::config::Format;

#[derive(Parser)]
#[command(name = "muxlink")]
pub struct AppOptions {
	/// Set the format of the config file. Can be 'toml' (default) or 'json'.
	#[cfg(feature = "parse-config")]
	#[arg(short, long)]
	format: Option<Format>,

	/// Read config from file.
	#[cfg(feature = "parse-config")]
	#[arg(short, long, value_name = "FILE")]
	config: Option<String>,

	/// Print version.
	#[arg(long)]
	version: bool,

	/// Set the log level. Must be one of ["debug", "info" (default), "warn", "error"]
	#[arg(long, value_name = "LEVEL")]
	log: Option<log::LevelFilter>,

	/// Set the output for log. Can be '@stdout', '@stderr', '@none' or a file path.
	#[arg(long, value_name = "FILE")]
	log_out: Option<String>,

	/// Override the login key.
	#[arg(long, value_name = "KEY")]
	key: Option<String>,

	#[command(subcommand)]
	mode: Option<ModeArgs>,
}

#[derive(Subcommand)]
enum ModeArgs {
	/// Accept tunnels from clients.
	Server {
		/// Address to listen on.
		#[arg(short, long, value_name = "ADDR")]
		listen: String,
	},
	/// Keep a tunnel to a server.
	Client {
		/// Address of the server.
		#[arg(short, long, value_name = "ADDR")]
		server: String,
		/// Name of this client, unique on the server.
		#[arg(short, long)]
		name: String,
		/// One of 'proxy', 'reverse_proxy', 'socks5' or 'reverse_socks5'.
		#[arg(short = 't', long = "type", value_name = "TYPE")]
		client_type: ClientType,
		/// Address the listening side binds.
		#[arg(long, value_name = "ADDR", default_value = "")]
		from: String,
		/// Address the dialing side connects to in proxy modes.
		#[arg(long, value_name = "ADDR", default_value = "")]
		to: String,
	},
}

impl From<ModeArgs> for Mode {
	fn from(args: ModeArgs) -> Self {
		match args {
			ModeArgs::Server { listen } => Mode::Server(ServerSettings { listen }),
			ModeArgs::Client {
				server,
				name,
				client_type,
				from,
				to,
			} => Mode::Client(ClientSettings {
				server,
				name,
				client_type,
				proxy_proto: ProxyProto::Tcp,
				from_addr: from,
				to_addr: to,
			}),
		}
	}
}

impl AppOptions {
	pub fn new_from_args() -> Self {
		Self::parse()
	}

	pub fn into_action(self) -> Result<Action, BoxStdErr> {
		if self.version {
			return Ok(Action::CheckVersion);
		}

		let coms = ActionCommons {
			log: self.log,
			log_out: self.log_out.map(|s| LogOutput::from_str(&s)),
			key: self.key,
		};

		#[cfg(feature = "parse-config")]
		if let Some(path) = self.config {
			if self.mode.is_some() {
				return Err("subcommands are incompatible with --config".into());
			}
			let path = std::path::PathBuf::from(path);
			let format = self.format.unwrap_or_else(|| {
				let mut format = Format::default();
				if let Some(ext) = path.extension() {
					if ext.eq_ignore_ascii_case("json") {
						format = Format::Json;
					}
				}
				format
			});
			return Ok(Action::Serve(ServeAction::File { coms, path, format }));
		}

		if let Some(mode) = self.mode {
			return Ok(Action::Serve(ServeAction::Args {
				coms,
				mode: mode.into(),
			}));
		}

		let mut cmd = Self::command();
		cmd.print_help()?;
		std::process::exit(exitcode::USAGE);
	}
}

pub enum Action {
	CheckVersion,
	Serve(ServeAction),
}

/// Options that override the config file.
pub struct ActionCommons {
	pub log: Option<log::LevelFilter>,
	/// `Some(None)` disables logging.
	pub log_out: Option<Option<LogOutput>>,
	pub key: Option<String>,
}

impl ActionCommons {
	pub fn apply(self, conf: &mut Config) {
		if let Some(level) = self.log {
			conf.log.level = level;
		}
		if let Some(output) = self.log_out {
			conf.log.output = output;
		}
		if let Some(key) = self.key {
			conf.tunnel.key = key;
		}
	}
}

pub enum ServeAction {
	#[cfg(feature = "parse-config")]
	File {
		coms: ActionCommons,
		path: std::path::PathBuf,
		format: Format,
	},
	Args {
		coms: ActionCommons,
		mode: Mode,
	},
}

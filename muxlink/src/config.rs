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


use crate::BoxStdErr;
use fern::colors::{Color, ColoredLevelConfig};
use log::{Level, LevelFilter};
use muxlink_lib::{Builder, ClientSettings};
use std::{borrow::Cow, str::FromStr};

#[allow(dead_code)]
#[derive(Clone, Copy)]
pub enum Format {
	Toml,
	Json,
}

impl FromStr for Format {
	type Err = Cow<'static, str>;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let mut s = s.to_string();
		s.make_ascii_lowercase();
		Ok(match s.as_str() {
			"toml" => Self::Toml,
			"json" => Self::Json,
			_ => return Err("must be either 'toml' or 'json'".into()),
		})
	}
}

impl Default for Format {
	fn default() -> Self {
		Format::Toml
	}
}

// ------------------- Logging -------------------
const STR_STDOUT: &str = "@stdout";
const STR_STDERR: &str = "@stderr";
const STR_NONE: &str = "@none";

pub enum LogOutput {
	Stdout,
	Stderr,
	File(String),
}

impl LogOutput {
	pub fn is_colorful(&self) -> bool {
		matches!(self, Self::Stdout | Self::Stderr)
	}

	pub fn from_str(s: &str) -> Option<Self> {
		match s {
			STR_NONE => None,
			STR_STDOUT | "" => Some(LogOutput::Stdout),
			STR_STDERR => Some(LogOutput::Stderr),
			_ => Some(LogOutput::File(s.to_string())),
		}
	}
}

#[cfg(feature = "parse-config")]
fn deserialize_output<'de, D>(deserializer: D) -> Result<Option<LogOutput>, D::Error>
where
	D: serde::Deserializer<'de>,
{
	let s = <String as serde::Deserialize<'de>>::deserialize(deserializer)?;
	Ok(LogOutput::from_str(&s))
}

#[cfg_attr(
	feature = "parse-config",
	derive(serde::Deserialize),
	serde(deny_unknown_fields)
)]
pub struct Log {
	#[cfg_attr(feature = "parse-config", serde(default = "default_log_level"))]
	pub level: LevelFilter,
	#[cfg_attr(
		feature = "parse-config",
		serde(default = "default_output"),
		serde(deserialize_with = "deserialize_output"),
		serde(rename = "output")
	)]
	pub output: Option<LogOutput>,
}

impl Log {
	/// Initialize logger.
	///
	/// DO NOT call this function more than once!
	pub fn init_logger(&self) -> Result<(), BoxStdErr> {
		let output = match &self.output {
			Some(output) => output,
			// Ignore empty output
			None => return Ok(()),
		};
		let time_format =
			time::format_description::parse("[year]-[month]-[day]T[hour]:[minute]:[second]Z")?;
		let colors = ColoredLevelConfig::new()
			.info(Color::Blue)
			.trace(Color::Magenta);
		let is_colorful = output.is_colorful();
		let dispatch = fern::Dispatch::new()
			.level(self.level)
			.format(move |out, message, record| {
				let time = time::OffsetDateTime::now_utc()
					.format(&time_format)
					.unwrap_or_default();
				let level: Cow<str> = if is_colorful {
					colors.color(record.level()).to_string().into()
				} else {
					record.level().as_str().into()
				};
				// Targets only matter when debugging.
				let target = if record.level() <= Level::Info {
					""
				} else {
					record.target()
				};
				out.finish(format_args!("[{time} {level} {target}] {message}"));
			});
		match output {
			LogOutput::Stdout => dispatch.chain(std::io::stdout()),
			LogOutput::Stderr => dispatch.chain(std::io::stderr()),
			LogOutput::File(f) => dispatch.chain(fern::log_file(f)?),
		}
		.apply()?;
		Ok(())
	}
}

impl Default for Log {
	fn default() -> Self {
		Log {
			level: default_log_level(),
			output: Some(LogOutput::Stdout),
		}
	}
}

fn default_log_level() -> LevelFilter {
	LevelFilter::Info
}

#[allow(clippy::unnecessary_wraps)]
#[allow(dead_code)]
fn default_output() -> Option<LogOutput> {
	Some(LogOutput::Stdout)
}

// ------------------- Config -------------------
#[cfg_attr(
	feature = "parse-config",
	derive(serde::Deserialize),
	serde(deny_unknown_fields)
)]
pub struct ServerSettings {
	/// Address tunnels are accepted on.
	pub listen: String,
}

/// What this process runs.
pub enum Mode {
	Server(ServerSettings),
	Client(ClientSettings),
}

#[cfg_attr(
	feature = "parse-config",
	derive(serde::Deserialize),
	serde(deny_unknown_fields)
)]
#[derive(Default)]
pub struct Config {
	#[cfg_attr(feature = "parse-config", serde(default))]
	pub log: Log,
	#[cfg_attr(feature = "parse-config", serde(default))]
	pub tunnel: Builder,
	#[cfg_attr(feature = "parse-config", serde(default))]
	pub server: Option<ServerSettings>,
	#[cfg_attr(feature = "parse-config", serde(default))]
	pub client: Option<ClientSettings>,
}

impl Config {
	/// Takes the `[server]` or `[client]` table out of the config.
	///
	/// # Errors
	///
	/// Returns an error unless exactly one of them is set.
	pub fn take_mode(&mut self) -> Result<Mode, Cow<'static, str>> {
		match (self.server.take(), self.client.take()) {
			(Some(s), None) => Ok(Mode::Server(s)),
			(None, Some(c)) => Ok(Mode::Client(c)),
			(Some(_), Some(_)) => Err("only one of [server] and [client] can be set".into()),
			(None, None) => Err("either [server] or [client] must be set".into()),
		}
	}
}

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


//! Tunnel settings shared by clients and servers.

use crate::transport::{Proto, UnsupportedProto};
use std::{borrow::Cow, time::Duration};

/// Bytes reserved in every DATA message for the frame header.
const DATA_FRAME_HEADROOM: usize = 512;
const MIN_MSG_SIZE: usize = 2 * DATA_FRAME_HEADROOM;

const fn default_max_msg_size() -> usize {
	1024 * 1024
}

const fn default_main_buffer() -> usize {
	1024 * 1024
}

const fn default_conn_buffer() -> usize {
	1024
}

const fn default_established_timeout() -> u64 {
	10
}

const fn default_ping_inter() -> u64 {
	1
}

const fn default_ping_timeout_inter() -> u64 {
	5
}

const fn default_conn_timeout() -> u64 {
	300
}

const fn default_connect_timeout() -> u64 {
	10
}

fn default_proto() -> Cow<'static, str> {
	Cow::Borrowed("tcp")
}

fn default_key() -> String {
	"123456".into()
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
	#[error("value of '{0}' cannot be zero")]
	ValueIsZero(Cow<'static, str>),
	#[error("max_msg_size must be at least {min}, not {value}")]
	MaxMsgSizeTooSmall { value: usize, min: usize },
	#[error("{0}")]
	Proto(#[from] UnsupportedProto),
}

/// Validated tunnel settings.
#[derive(Debug, Clone)]
pub struct Config {
	pub max_msg_size: usize,
	/// Capacity of the tunnel queues, in frames.
	pub main_buffer: usize,
	/// Capacity of every sub-connection queue, in frames.
	pub conn_buffer: usize,
	pub established_timeout: Duration,
	pub ping_inter: Duration,
	/// Number of unanswered pings tolerated.
	pub ping_timeout_inter: u64,
	pub conn_timeout: Duration,
	pub connect_timeout: Duration,
	pub proto: Proto,
	pub key: String,
	pub encrypt: String,
	pub compress: usize,
	pub show_ping: bool,
	pub username: String,
	pub password: String,
}

impl Config {
	/// Largest chunk read from a local socket into one DATA frame.
	#[inline]
	#[must_use]
	pub fn data_chunk_size(&self) -> usize {
		self.max_msg_size - DATA_FRAME_HEADROOM
	}
}

impl Default for Config {
	fn default() -> Self {
		Self {
			max_msg_size: default_max_msg_size(),
			main_buffer: default_main_buffer(),
			conn_buffer: default_conn_buffer(),
			established_timeout: Duration::from_secs(default_established_timeout()),
			ping_inter: Duration::from_secs(default_ping_inter()),
			ping_timeout_inter: default_ping_timeout_inter(),
			conn_timeout: Duration::from_secs(default_conn_timeout()),
			connect_timeout: Duration::from_secs(default_connect_timeout()),
			proto: Proto::Tcp,
			key: default_key(),
			encrypt: String::new(),
			compress: 0,
			show_ping: false,
			username: String::new(),
			password: String::new(),
		}
	}
}

#[derive(Debug, Clone)]
#[cfg_attr(
	feature = "use_serde",
	derive(serde::Deserialize),
	serde(deny_unknown_fields)
)]
pub struct Builder {
	/// Maximum size of one message on the tunnel.
	///
	/// Default: 1048576
	#[cfg_attr(feature = "use_serde", serde(default = "default_max_msg_size"))]
	pub max_msg_size: usize,
	/// Capacity of the tunnel queues, in frames.
	///
	/// Default: 1048576
	#[cfg_attr(feature = "use_serde", serde(default = "default_main_buffer"))]
	pub main_buffer: usize,
	/// Capacity of every sub-connection queue, in frames.
	///
	/// Default: 1024
	#[cfg_attr(feature = "use_serde", serde(default = "default_conn_buffer"))]
	pub conn_buffer: usize,
	/// Seconds a tunnel or sub-connection may take to be established.
	///
	/// Default: 10
	#[cfg_attr(feature = "use_serde", serde(default = "default_established_timeout"))]
	pub established_timeout: u64,
	/// Seconds between pings.
	///
	/// Default: 1
	#[cfg_attr(feature = "use_serde", serde(default = "default_ping_inter"))]
	pub ping_inter: u64,
	/// Tunnel is dropped once more than this many pings are unanswered.
	///
	/// Default: 5
	#[cfg_attr(feature = "use_serde", serde(default = "default_ping_timeout_inter"))]
	pub ping_timeout_inter: u64,
	/// Sub-connection is dropped after this many seconds without data.
	///
	/// Default: 300
	#[cfg_attr(feature = "use_serde", serde(default = "default_conn_timeout"))]
	pub conn_timeout: u64,
	/// Seconds allowed for dialing a tunnel or a target.
	///
	/// Default: 10
	#[cfg_attr(feature = "use_serde", serde(default = "default_connect_timeout"))]
	pub connect_timeout: u64,
	/// Transport of the tunnel.
	///
	/// Default: "tcp"
	#[cfg_attr(feature = "use_serde", serde(default = "default_proto"))]
	pub proto: Cow<'static, str>,
	/// Shared login key.
	///
	/// Default: "123456"
	#[cfg_attr(feature = "use_serde", serde(default = "default_key"))]
	pub key: String,
	/// Secret for DATA payload encryption, empty to disable.
	#[cfg_attr(feature = "use_serde", serde(default))]
	pub encrypt: String,
	/// DATA payloads longer than this are compressed, 0 to disable.
	#[cfg_attr(feature = "use_serde", serde(default))]
	pub compress: usize,
	/// Log ping round trips.
	#[cfg_attr(feature = "use_serde", serde(default))]
	pub show_ping: bool,
	/// SOCKS5 username, empty to disable authentication.
	#[cfg_attr(feature = "use_serde", serde(default))]
	pub username: String,
	/// SOCKS5 password.
	#[cfg_attr(feature = "use_serde", serde(default))]
	pub password: String,
}

impl Builder {
	/// Validates and creates a [`Config`].
	///
	/// # Errors
	///
	/// Returns a [`BuildError`] if any size or interval is zero, `max_msg_size`
	/// is too small or `proto` is not supported.
	pub fn build(&self) -> Result<Config, BuildError> {
		check_zero(self.max_msg_size as u64, "max_msg_size")?;
		if self.max_msg_size < MIN_MSG_SIZE {
			return Err(BuildError::MaxMsgSizeTooSmall {
				value: self.max_msg_size,
				min: MIN_MSG_SIZE,
			});
		}
		check_zero(self.main_buffer as u64, "main_buffer")?;
		check_zero(self.conn_buffer as u64, "conn_buffer")?;
		check_zero(self.established_timeout, "established_timeout")?;
		check_zero(self.ping_inter, "ping_inter")?;
		check_zero(self.ping_timeout_inter, "ping_timeout_inter")?;
		check_zero(self.conn_timeout, "conn_timeout")?;
		check_zero(self.connect_timeout, "connect_timeout")?;
		let proto = self.proto.parse::<Proto>()?;
		Ok(Config {
			max_msg_size: self.max_msg_size,
			main_buffer: self.main_buffer,
			conn_buffer: self.conn_buffer,
			established_timeout: Duration::from_secs(self.established_timeout),
			ping_inter: Duration::from_secs(self.ping_inter),
			ping_timeout_inter: self.ping_timeout_inter,
			conn_timeout: Duration::from_secs(self.conn_timeout),
			connect_timeout: Duration::from_secs(self.connect_timeout),
			proto,
			key: self.key.clone(),
			encrypt: self.encrypt.clone(),
			compress: self.compress,
			show_ping: self.show_ping,
			username: self.username.clone(),
			password: self.password.clone(),
		})
	}
}

impl Default for Builder {
	fn default() -> Self {
		Self {
			max_msg_size: default_max_msg_size(),
			main_buffer: default_main_buffer(),
			conn_buffer: default_conn_buffer(),
			established_timeout: default_established_timeout(),
			ping_inter: default_ping_inter(),
			ping_timeout_inter: default_ping_timeout_inter(),
			conn_timeout: default_conn_timeout(),
			connect_timeout: default_connect_timeout(),
			proto: default_proto(),
			key: default_key(),
			encrypt: String::new(),
			compress: 0,
			show_ping: false,
			username: String::new(),
			password: String::new(),
		}
	}
}

/// Returns Err([`BuildError::ValueIsZero`]) if `val` is zero.
#[inline]
fn check_zero(val: u64, val_name: &'static str) -> Result<u64, BuildError> {
	if val > 0 {
		Ok(val)
	} else {
		Err(BuildError::ValueIsZero(Cow::Borrowed(val_name)))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_default_builds() {
		let conf = Builder::default().build().unwrap();
		assert_eq!(conf.max_msg_size, 1024 * 1024);
		assert_eq!(conf.conn_buffer, 1024);
		assert_eq!(conf.ping_timeout_inter, 5);
		assert_eq!(conf.conn_timeout, Duration::from_secs(300));
		assert_eq!(conf.proto, Proto::Tcp);
		assert_eq!(conf.key, "123456");
		assert!(conf.data_chunk_size() < conf.max_msg_size);
	}

	#[test]
	fn test_zero_rejected() {
		let b = Builder {
			ping_inter: 0,
			..Builder::default()
		};
		assert!(matches!(b.build().unwrap_err(), BuildError::ValueIsZero(n) if n == "ping_inter"));
	}

	#[test]
	fn test_small_msg_size_rejected() {
		let b = Builder {
			max_msg_size: 100,
			..Builder::default()
		};
		assert!(matches!(
			b.build().unwrap_err(),
			BuildError::MaxMsgSizeTooSmall { value: 100, .. }
		));
	}

	#[test]
	fn test_unknown_proto_rejected() {
		let b = Builder {
			proto: "quic".into(),
			..Builder::default()
		};
		assert!(matches!(b.build().unwrap_err(), BuildError::Proto(_)));
	}
}

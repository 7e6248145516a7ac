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


//! Frames exchanged over a tunnel.

use crate::prelude::*;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum FrameType {
	Login = 1,
	LoginRsp = 2,
	Data = 3,
	Ping = 4,
	Pong = 5,
	Open = 6,
	OpenRsp = 7,
	Close = 8,
}

impl FrameType {
	#[must_use]
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Login => "Login",
			Self::LoginRsp => "LoginRsp",
			Self::Data => "Data",
			Self::Ping => "Ping",
			Self::Pong => "Pong",
			Self::Open => "Open",
			Self::OpenRsp => "OpenRsp",
			Self::Close => "Close",
		}
	}
}

impl fmt::Display for FrameType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Protocol of the sub-connections carried by a tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ProxyProto {
	Tcp = 0,
	Udp = 1,
	Rudp = 2,
	Ricmp = 3,
}

impl ProxyProto {
	#[must_use]
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Tcp => "tcp",
			Self::Udp => "udp",
			Self::Rudp => "rudp",
			Self::Ricmp => "ricmp",
		}
	}
}

impl FromStr for ProxyProto {
	type Err = UnknownName;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Ok(match s.to_ascii_lowercase().as_str() {
			"tcp" => Self::Tcp,
			"udp" => Self::Udp,
			"rudp" => Self::Rudp,
			"ricmp" => Self::Ricmp,
			_ => return Err(UnknownName(s.into())),
		})
	}
}

impl fmt::Display for ProxyProto {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Decides which tunnel side listens locally and which side dials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ClientType {
	/// Client listens, server dials.
	Proxy = 0,
	/// Server listens, client dials.
	ReverseProxy = 1,
	/// Client serves SOCKS5, server dials.
	Socks5 = 2,
	/// Server serves SOCKS5, client dials.
	ReverseSocks5 = 3,
}

impl ClientType {
	#[must_use]
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Proxy => "proxy",
			Self::ReverseProxy => "reverse_proxy",
			Self::Socks5 => "socks5",
			Self::ReverseSocks5 => "reverse_socks5",
		}
	}
}

impl FromStr for ClientType {
	type Err = UnknownName;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Ok(match s.to_ascii_lowercase().as_str() {
			"proxy" => Self::Proxy,
			"reverse_proxy" => Self::ReverseProxy,
			"socks5" => Self::Socks5,
			"reverse_socks5" => Self::ReverseSocks5,
			_ => return Err(UnknownName(s.into())),
		})
	}
}

impl fmt::Display for ClientType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, thiserror::Error)]
#[error("unknown name '{0}'")]
pub struct UnknownName(pub String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginFrame {
	pub proxy_proto: ProxyProto,
	pub client_type: ClientType,
	pub from_addr: String,
	pub to_addr: String,
	pub name: String,
	pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginRspFrame {
	pub ret: bool,
	pub msg: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DataFrame {
	pub id: Tag,
	pub data: Vec<u8>,
	pub compressed: bool,
	/// CRC32 of the plain `data`.
	pub crc: u32,
	/// Position in the sending direction, wrapping at [`INDEX_WINDOW`].
	pub index: u32,
}

/// Size of the wrapping window of [`DataFrame::index`].
pub const INDEX_WINDOW: u32 = 1024;

/// Index that follows `prev` in the same direction.
#[inline]
#[must_use]
pub fn next_index(prev: u32) -> u32 {
	(prev + 1) % INDEX_WINDOW
}

/// Timestamps are nanoseconds since the unix epoch of the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingFrame {
	pub time: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PongFrame {
	pub time: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenFrame {
	pub id: Tag,
	/// Empty for statically configured targets.
	pub to_addr: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRspFrame {
	pub id: Tag,
	pub ret: bool,
	pub msg: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
	pub id: Tag,
}

/// One tunnel message. The variant always matches the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
	Login(LoginFrame),
	LoginRsp(LoginRspFrame),
	Data(DataFrame),
	Ping(PingFrame),
	Pong(PongFrame),
	Open(OpenFrame),
	OpenRsp(OpenRspFrame),
	Close(CloseFrame),
}

impl Frame {
	#[must_use]
	pub fn kind(&self) -> FrameType {
		match self {
			Frame::Login(_) => FrameType::Login,
			Frame::LoginRsp(_) => FrameType::LoginRsp,
			Frame::Data(_) => FrameType::Data,
			Frame::Ping(_) => FrameType::Ping,
			Frame::Pong(_) => FrameType::Pong,
			Frame::Open(_) => FrameType::Open,
			Frame::OpenRsp(_) => FrameType::OpenRsp,
			Frame::Close(_) => FrameType::Close,
		}
	}

	/// Sub-connection this frame belongs to, if any.
	#[must_use]
	pub fn conn_id(&self) -> Option<&Tag> {
		match self {
			Frame::Data(f) => Some(&f.id),
			Frame::Open(f) => Some(&f.id),
			Frame::OpenRsp(f) => Some(&f.id),
			Frame::Close(f) => Some(&f.id),
			Frame::Login(_) | Frame::LoginRsp(_) | Frame::Ping(_) | Frame::Pong(_) => None,
		}
	}

	#[must_use]
	pub fn login_rsp(ret: bool, msg: impl Into<String>) -> Self {
		Frame::LoginRsp(LoginRspFrame {
			ret,
			msg: msg.into(),
		})
	}

	#[must_use]
	pub fn open_rsp(id: Tag, ret: bool, msg: impl Into<String>) -> Self {
		Frame::OpenRsp(OpenRspFrame {
			id,
			ret,
			msg: msg.into(),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_next_index_wraps() {
		assert_eq!(next_index(0), 1);
		assert_eq!(next_index(INDEX_WINDOW - 2), INDEX_WINDOW - 1);
		assert_eq!(next_index(INDEX_WINDOW - 1), 0);
	}

	#[test]
	fn test_client_type_from_str() {
		assert_eq!(
			ClientType::from_str("REVERSE_SOCKS5").unwrap(),
			ClientType::ReverseSocks5
		);
		assert_eq!(ClientType::from_str("proxy").unwrap(), ClientType::Proxy);
		assert!(ClientType::from_str("bridge").is_err());
		assert_eq!(ProxyProto::from_str("TCP").unwrap(), ProxyProto::Tcp);
	}
}

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


//! Connections that carry tunnels and sub-connections.

mod stream;
pub use stream::{AsyncReadWrite, BoxRead, BoxWrite};

use crate::{prelude::*, protocol::ProxyProto};
use std::{fmt, io, time::Duration};
use tokio::net::{TcpListener, TcpStream};

/// Transport protocol with a concrete implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(
	feature = "use_serde",
	derive(serde::Deserialize),
	serde(rename_all = "lowercase")
)]
pub enum Proto {
	Tcp,
}

impl Proto {
	/// Connects to `addr`, giving up after `timeout`.
	///
	/// # Errors
	///
	/// Returns an error if `addr` cannot be resolved or reached in time.
	pub async fn dial(self, addr: &str, timeout: Duration) -> io::Result<Conn> {
		match self {
			Proto::Tcp => {
				let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
					.await
					.map_err(|_| {
						io::Error::new(
							io::ErrorKind::TimedOut,
							format!("connect to {} timeout", addr),
						)
					})??;
				Conn::from_tcp(stream)
			}
		}
	}

	/// Binds a listener on `addr`.
	///
	/// # Errors
	///
	/// Returns an error if binding fails.
	pub async fn listen(self, addr: &str) -> io::Result<Listener> {
		match self {
			Proto::Tcp => {
				let inner = TcpListener::bind(addr).await?;
				Ok(Listener { inner })
			}
		}
	}
}

impl FromStr for Proto {
	type Err = UnsupportedProto;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_lowercase().as_str() {
			"tcp" => Ok(Proto::Tcp),
			_ => Err(UnsupportedProto(s.into())),
		}
	}
}

impl TryFrom<ProxyProto> for Proto {
	type Error = UnsupportedProto;

	fn try_from(value: ProxyProto) -> Result<Self, Self::Error> {
		match value {
			ProxyProto::Tcp => Ok(Proto::Tcp),
			ProxyProto::Udp | ProxyProto::Rudp | ProxyProto::Ricmp => {
				Err(UnsupportedProto(value.as_str().into()))
			}
		}
	}
}

impl fmt::Display for Proto {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Proto::Tcp => f.write_str("tcp"),
		}
	}
}

#[derive(Debug, thiserror::Error)]
#[error("unsupported transport protocol '{0}'")]
pub struct UnsupportedProto(pub String);

/// An established connection.
///
/// Dropping both halves closes it.
pub struct Conn {
	stream: Box<dyn AsyncReadWrite>,
	info: String,
}

impl Conn {
	pub fn new(stream: Box<dyn AsyncReadWrite>, info: impl Into<String>) -> Self {
		Self {
			stream,
			info: info.into(),
		}
	}

	fn from_tcp(stream: TcpStream) -> io::Result<Self> {
		stream.set_nodelay(true)?;
		let info = format!("{}<--->{}", stream.local_addr()?, stream.peer_addr()?);
		Ok(Self::new(stream.into(), info))
	}

	/// Description for logs.
	#[inline]
	#[must_use]
	pub fn info(&self) -> &str {
		&self.info
	}

	#[must_use]
	pub fn split(self) -> (BoxRead, BoxWrite) {
		self.stream.split()
	}

	#[must_use]
	pub fn into_inner(self) -> Box<dyn AsyncReadWrite> {
		self.stream
	}
}

impl fmt::Debug for Conn {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_tuple("Conn").field(&self.info).finish()
	}
}

pub struct Listener {
	inner: TcpListener,
}

impl Listener {
	/// Waits for the next connection.
	///
	/// # Errors
	///
	/// Returns an error if accepting fails.
	pub async fn accept(&self) -> io::Result<Conn> {
		let (stream, _) = self.inner.accept().await?;
		Conn::from_tcp(stream)
	}

	/// # Errors
	///
	/// Returns an error if the address of the socket cannot be read.
	pub fn local_addr(&self) -> io::Result<SocketAddr> {
		self.inner.local_addr()
	}
}

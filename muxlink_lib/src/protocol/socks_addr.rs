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
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::{
	fmt::{self, Display},
	io,
};

const EMPTY_STRING: &str = "empty string";
const MAX_DOMAIN_LEN: usize = 255;

// See more at <https://tools.ietf.org/html/rfc1928>
#[derive(Debug, Clone, Copy, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum AddrType {
	Ipv4 = 1_u8,
	Name = 3_u8,
	Ipv6 = 4_u8,
}

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
	#[error("str is not utf8 ({0})")]
	StrNotUtf8(std::str::Utf8Error),
	#[error("unknown address type {0}")]
	UnknownAddressType(u8),
	#[error("invalid domain ({0})")]
	InvalidDomain(BoxStdErr),
	#[error("invalid port ({0})")]
	InvalidPort(BoxStdErr),
	#[error("invalid address ({0})")]
	InvalidAddress(BoxStdErr),
	#[error("IO error ({0})")]
	Io(#[from] io::Error),
}

// -------------------------------------------------------
//                     SocksDestination
// -------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SocksDestination {
	/// Lowercase ASCII domain name of at most 255 bytes.
	Name(Tag),
	Ip(IpAddr),
}

impl SocksDestination {
	/// Create a new `SocksDestination` from a domain name.
	///
	/// # Errors
	///
	/// Return a [`ReadError`] if `value` is not a valid domain name.
	pub fn new_domain(value: &str) -> Result<Self, ReadError> {
		let value = value.strip_suffix('.').unwrap_or(value);
		if value.is_empty() {
			return Err(ReadError::InvalidDomain(EMPTY_STRING.into()));
		}
		if value.len() > MAX_DOMAIN_LEN {
			return Err(ReadError::InvalidDomain("too long".into()));
		}
		if let Some(c) = value
			.chars()
			.find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '.' || *c == '_'))
		{
			return Err(ReadError::InvalidDomain(
				format!("invalid character '{}'", c).into(),
			));
		}
		Ok(Self::Name(value.to_ascii_lowercase().into()))
	}

	#[inline]
	#[must_use]
	pub fn atyp(&self) -> AddrType {
		match self {
			SocksDestination::Name(_) => AddrType::Name,
			SocksDestination::Ip(IpAddr::V4(_)) => AddrType::Ipv4,
			SocksDestination::Ip(IpAddr::V6(_)) => AddrType::Ipv6,
		}
	}

	/// Reads a destination of type `atyp` from `r`.
	///
	/// The format for each address type are as following:
	/// - [`AddrType::Ipv4`]: | 4 bytes |
	/// - [`AddrType::Ipv6`]: | 16 bytes |
	/// - [`AddrType::Name`]: | n, 1 byte | n bytes |
	///
	/// # Errors
	///
	/// [`ReadError`] will be returned if error occurred.
	pub async fn async_read_from_atyp(
		r: &mut (impl AsyncRead + Unpin),
		atyp: AddrType,
	) -> Result<Self, ReadError> {
		Ok(match atyp {
			AddrType::Ipv4 => Ipv4Addr::from(r.read_u32().await?).into(),
			AddrType::Ipv6 => Ipv6Addr::from(r.read_u128().await?).into(),
			AddrType::Name => {
				let len = r.read_u8().await?;
				if len == 0 {
					return Err(ReadError::InvalidDomain(EMPTY_STRING.into()));
				}
				// Domain length is a u8, which will never be larger than 256.
				let mut buffer = [0_u8; 256];
				let buffer = &mut buffer[..len as usize];
				r.read_exact(buffer).await?;
				let name = std::str::from_utf8(buffer).map_err(ReadError::StrNotUtf8)?;
				SocksDestination::from_str(name)?
			}
		})
	}

	#[allow(clippy::cast_possible_truncation)]
	pub fn write_to_no_atyp(&self, buf: &mut impl BufMut) {
		match self {
			SocksDestination::Name(name) => {
				// Length is checked on creation.
				buf.put_u8(name.len() as u8);
				buf.put(name.as_bytes());
			}
			SocksDestination::Ip(IpAddr::V4(ip)) => buf.put(&ip.octets()[..]),
			SocksDestination::Ip(IpAddr::V6(ip)) => buf.put(&ip.octets()[..]),
		}
	}
}

impl FromStr for SocksDestination {
	type Err = ReadError;
	fn from_str(s: &str) -> Result<Self, Self::Err> {
		if let Ok(ip) = IpAddr::from_str(s) {
			return Ok(Self::Ip(ip));
		}
		Self::new_domain(s)
	}
}

impl From<Ipv4Addr> for SocksDestination {
	#[inline]
	fn from(ip: Ipv4Addr) -> Self {
		Self::Ip(ip.into())
	}
}

impl From<Ipv6Addr> for SocksDestination {
	#[inline]
	fn from(ip: Ipv6Addr) -> Self {
		Self::Ip(ip.into())
	}
}

impl From<IpAddr> for SocksDestination {
	#[inline]
	fn from(ip: IpAddr) -> Self {
		Self::Ip(ip)
	}
}

impl Display for SocksDestination {
	#[inline]
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Ip(ip) => ip.fmt(f),
			Self::Name(name) => name.fmt(f),
		}
	}
}

// -------------------------------------------------------
//                       SocksAddr
// -------------------------------------------------------

/// Destination of a sub-connection, as carried in OPEN frames.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SocksAddr {
	pub dest: SocksDestination,
	pub port: u16,
}

impl SocksAddr {
	#[inline]
	#[must_use]
	pub fn new(dest: SocksDestination, port: u16) -> Self {
		Self { dest, port }
	}

	/// Reads an address in SOCKS5 format:
	/// ```not_rust
	/// +------+----------------+----------------+
	/// | ATYP |  Destination   |     Port       |
	/// +------+----------------+----------------+
	/// | u8   | various bytes  |   2 bytes      |
	/// |      |                | big endian u16 |
	/// +------+----------------+----------------+
	/// ```
	///
	/// # Errors
	///
	/// If there is any error, an [`ReadError`] will be returned.
	pub async fn async_read_from<R>(r: &mut R) -> Result<Self, ReadError>
	where
		R: AsyncRead + Unpin,
	{
		let atyp_num = r.read_u8().await?;
		let atyp =
			AddrType::try_from(atyp_num).map_err(|_| ReadError::UnknownAddressType(atyp_num))?;
		let dest = SocksDestination::async_read_from_atyp(r, atyp).await?;
		let port = r.read_u16().await?;
		Ok(Self::new(dest, port))
	}

	/// Writes the address in the format read by [`Self::async_read_from`].
	#[inline]
	pub fn write_to<B: BufMut>(&self, buf: &mut B) {
		buf.put_u8(self.dest.atyp().into());
		self.dest.write_to_no_atyp(buf);
		buf.put_u16(self.port);
	}

	/// Parses `host:port`, where host is an IP or a domain.
	/// IPv6 hosts must be in brackets.
	///
	/// # Errors
	///
	/// Returns a [`ReadError`] if the port is missing or the string is invalid.
	pub fn parse_str(s: &str) -> Result<Self, ReadError> {
		if let Ok(addr) = s.parse::<SocketAddr>() {
			return Ok(addr.into());
		}
		if s.is_empty() {
			return Err(ReadError::InvalidAddress(EMPTY_STRING.into()));
		}
		let (host, port) = s
			.rsplit_once(':')
			.ok_or_else(|| ReadError::InvalidAddress("missing port".into()))?;
		if port.is_empty() {
			return Err(ReadError::InvalidPort(EMPTY_STRING.into()));
		}
		let port = port
			.parse::<u16>()
			.map_err(|err| ReadError::InvalidPort(err.into()))?;
		let dest = SocksDestination::new_domain(host)?;
		Ok(Self { dest, port })
	}
}

impl FromStr for SocksAddr {
	type Err = ReadError;
	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::parse_str(s)
	}
}

impl Display for SocksAddr {
	#[inline]
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match &self.dest {
			SocksDestination::Name(name) => write!(f, "{}:{}", name, self.port),
			SocksDestination::Ip(ip) => SocketAddr::new(*ip, self.port).fmt(f),
		}
	}
}

impl From<SocketAddr> for SocksAddr {
	#[inline]
	fn from(addr: SocketAddr) -> Self {
		Self {
			dest: addr.ip().into(),
			port: addr.port(),
		}
	}
}

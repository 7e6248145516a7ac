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


use crate::{prelude::*, protocol::socks_addr::ReadError};
use num_enum::TryFromPrimitive;
use std::{fmt::Display, io};

pub const VER5: u8 = 5;
/// Subnegotiation version.
///
/// See more at <https://datatracker.ietf.org/doc/html/rfc1929#section-2>
pub const SUB_VERS: u8 = 1_u8;
pub const AUTH_SUCCESSFUL: u8 = 0;
pub const AUTH_FAILED: u8 = 0xff;
pub const NO_ACCEPTABLE_METHOD: u8 = 0xff;

/// Reply sent as soon as a CONNECT request is read: succeeded, bound to
/// `0.0.0.0:2115`.
pub const CONNECT_REPLY: [u8; 10] = [
	VER5,
	ReplyCode::Succeeded as u8,
	0x00,
	0x01,
	0x00,
	0x00,
	0x00,
	0x00,
	0x08,
	0x43,
];

#[derive(Debug, TryFromPrimitive, PartialEq, Eq, Copy, Clone)]
#[repr(u8)]
pub enum CommandCode {
	Connect = 1,
	Bind = 2,
	Udp = 3,
}

impl Display for CommandCode {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			CommandCode::Connect => write!(f, "CONNECT"),
			CommandCode::Bind => write!(f, "BIND"),
			CommandCode::Udp => write!(f, "UDP_ASSOCIATE"),
		}?;
		write!(f, "({})", *self as u8)
	}
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum AcceptableMethod {
	NoAuthentication = 0,
	UsernamePassword = 2,
}

/// SOCKS5 reply code.
///
/// See more at <https://datatracker.ietf.org/doc/html/rfc1928#section-6>.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
#[repr(u8)]
pub enum ReplyCode {
	Succeeded = 0,
	CommandNotSupported = 7,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("wrong socks version '{0}'")]
	WrongVersion(u8),
	#[error("unsupported authentication methods '{0:?}'")]
	UnsupportedMethod(Vec<u8>),
	#[error("unknown command code '{0}'")]
	UnknownCommand(u8),
	#[error("unsupported command {0}")]
	UnsupportedCommand(CommandCode),
	#[error("failed authentication")]
	FailedAuthentication,
	#[error("cannot read address ({0})")]
	CannotReadAddr(ReadError),
	#[error("handshake timeout")]
	Timeout,
	#[error("IO error ({0})")]
	Io(#[from] io::Error),
}

#[inline]
pub fn check_version(ver: u8) -> Result<(), Error> {
	if ver != VER5 {
		return Err(Error::WrongVersion(ver));
	}
	Ok(())
}

pub struct Request {
	pub code: u8,
	pub addr: SocksAddr,
}

impl Request {
	/// Read the request in the following format:
	///```not_rust
	/// +----+-----+-------+------+----------+----------+
	/// |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
	/// +----+-----+-------+------+----------+----------+
	/// | 1  |  1  | X'00' |  1   | Variable |    2     |
	/// +----+-----+-------+------+----------+----------+
	///```
	pub async fn read<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, Error> {
		let mut tmp_buf = [0_u8; 3];
		reader.read_exact(&mut tmp_buf).await?;

		let (ver, cmd, _) = (tmp_buf[0], tmp_buf[1], tmp_buf[2]);
		check_version(ver)?;

		let addr = match SocksAddr::async_read_from(reader).await {
			Ok(addr) => addr,
			Err(ReadError::Io(e)) => return Err(Error::Io(e)),
			Err(e) => return Err(Error::CannotReadAddr(e)),
		};
		Ok(Self { code: cmd, addr })
	}
}

/// Writes a failure reply with `code` and an empty bound address.
pub async fn write_failure<W: AsyncWrite + Unpin>(w: &mut W, code: ReplyCode) -> io::Result<()> {
	w.write_all(&[VER5, code as u8, 0, 1, 0, 0, 0, 0, 0, 0])
		.await
}

pub struct Authentication {
	pub user: Vec<u8>,
	pub pass: Vec<u8>,
}

impl Authentication {
	/// Read the sub negotiation request in the following format:
	///```not_rust
	/// +----+------+----------+------+----------+
	/// |VER | ULEN |  UNAME   | PLEN |  PASSWD  |
	/// +----+------+----------+------+----------+
	/// | 1  |  1   | 1 to 255 |  1   | 1 to 255 |
	/// +----+------+----------+------+----------+
	///```
	pub async fn read<R>(reader: &mut R) -> Result<Self, Error>
	where
		R: AsyncRead + Unpin,
	{
		let ver = reader.read_u8().await?;
		if ver != SUB_VERS {
			return Err(Error::WrongVersion(ver));
		}
		let user = read_block(reader).await?;
		let pass = read_block(reader).await?;
		Ok(Self { user, pass })
	}
}

/// Read methods in the following format:
///```not_rust
/// +----+----------+----------+
/// |VER | NMETHODS | METHODS  |
/// +----+----------+----------+
/// | 1  |    1     | 1 to 255 |
/// +----+----------+----------+
///```
pub async fn read_methods<R>(reader: &mut R) -> Result<Vec<u8>, Error>
where
	R: AsyncRead + Unpin,
{
	let ver = reader.read_u8().await?;
	check_version(ver)?;
	Ok(read_block(reader).await?)
}

/// Read a block of data in the following format
///
///```not_rust
/// +-----+----------+
/// | LEN |   DATA   |
/// +-----+----------+
/// |  1  | 1 to 255 |
/// +-----+----------+
///```
async fn read_block<R>(reader: &mut R) -> io::Result<Vec<u8>>
where
	R: AsyncRead + Unpin + ?Sized,
{
	let len = usize::from(reader.read_u8().await?);
	let mut buf = vec![0_u8; len];
	reader.read_exact(&mut buf).await?;
	Ok(buf)
}

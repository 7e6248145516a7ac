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


//! Local SOCKS5 handshake of SOCKS5 Inputers.
//!
//! Only CONNECT is supported. Success is replied right away, before the
//! peer has dialed the destination.

mod utils;

pub use utils::Error;
use utils::{
	read_methods, write_failure, AcceptableMethod, Authentication, CommandCode, ReplyCode,
	Request, AUTH_FAILED, AUTH_SUCCESSFUL, CONNECT_REPLY, NO_ACCEPTABLE_METHOD, SUB_VERS, VER5,
};

use crate::prelude::*;

/// Username and password required from SOCKS5 clients.
#[derive(Debug, Clone)]
pub struct Credentials {
	pub user: String,
	pub pass: String,
}

impl Credentials {
	/// Returns `None` if `user` is empty.
	#[must_use]
	pub fn new(user: &str, pass: &str) -> Option<Self> {
		if user.is_empty() {
			None
		} else {
			Some(Self {
				user: user.into(),
				pass: pass.into(),
			})
		}
	}
}

/// Performs the server side of a SOCKS5 handshake and returns the
/// requested destination.
///
/// # Errors
///
/// Returns an error if the client speaks something else, fails
/// authentication or asks for anything but CONNECT.
pub async fn accept<S>(stream: &mut S, auth: Option<&Credentials>) -> Result<SocksAddr, Error>
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	let methods = read_methods(stream).await?;
	let wanted = if auth.is_some() {
		AcceptableMethod::UsernamePassword
	} else {
		AcceptableMethod::NoAuthentication
	};
	if !methods.contains(&(wanted as u8)) {
		stream.write_all(&[VER5, NO_ACCEPTABLE_METHOD]).await?;
		return Err(Error::UnsupportedMethod(methods));
	}
	stream.write_all(&[VER5, wanted as u8]).await?;

	if let Some(auth) = auth {
		// See more at <https://datatracker.ietf.org/doc/html/rfc1929>
		trace!("performing SOCKS5 username/password authentication");
		let req = Authentication::read(stream).await?;
		let success = req.user == auth.user.as_bytes() && req.pass == auth.pass.as_bytes();
		let status = if success {
			AUTH_SUCCESSFUL
		} else {
			AUTH_FAILED
		};
		stream.write_all(&[SUB_VERS, status]).await?;
		if !success {
			return Err(Error::FailedAuthentication);
		}
	}

	let request = Request::read(stream).await?;
	match CommandCode::try_from(request.code) {
		Ok(CommandCode::Connect) => {}
		Ok(cmd) => {
			write_failure(stream, ReplyCode::CommandNotSupported).await?;
			return Err(Error::UnsupportedCommand(cmd));
		}
		Err(_) => {
			write_failure(stream, ReplyCode::CommandNotSupported).await?;
			return Err(Error::UnknownCommand(request.code));
		}
	}
	stream.write_all(&CONNECT_REPLY).await?;
	debug!("SOCKS5 CONNECT to {}", request.addr);
	Ok(request.addr)
}

#[cfg(test)]
mod tests {
	use super::*;

	async fn client_connect(
		stream: &mut tokio::io::DuplexStream,
		auth: Option<(&str, &str)>,
		addr: &SocksAddr,
	) -> Vec<u8> {
		let method = if auth.is_some() { 2 } else { 0 };
		stream.write_all(&[VER5, 1, method]).await.unwrap();
		let mut rsp = [0_u8; 2];
		stream.read_exact(&mut rsp).await.unwrap();
		if rsp[1] == NO_ACCEPTABLE_METHOD {
			return rsp.to_vec();
		}
		if let Some((user, pass)) = auth {
			let mut buf = vec![SUB_VERS, user.len() as u8];
			buf.extend_from_slice(user.as_bytes());
			buf.push(pass.len() as u8);
			buf.extend_from_slice(pass.as_bytes());
			stream.write_all(&buf).await.unwrap();
			stream.read_exact(&mut rsp).await.unwrap();
			if rsp[1] != AUTH_SUCCESSFUL {
				return rsp.to_vec();
			}
		}
		let mut req = vec![VER5, CommandCode::Connect as u8, 0];
		addr.write_to(&mut req);
		stream.write_all(&req).await.unwrap();
		let mut reply = [0_u8; 10];
		stream.read_exact(&mut reply).await.unwrap();
		reply.to_vec()
	}

	#[tokio::test]
	async fn test_connect_no_auth() {
		let (mut client, mut server) = tokio::io::duplex(1024);
		let target = SocksAddr::from_str("example.com:80").unwrap();
		let (reply, res) = tokio::join!(
			client_connect(&mut client, None, &target),
			accept(&mut server, None)
		);
		assert_eq!(reply, CONNECT_REPLY);
		assert_eq!(res.unwrap(), target);
	}

	#[tokio::test]
	async fn test_connect_auth() {
		let creds = Credentials::new("user", "pass").unwrap();
		let (mut client, mut server) = tokio::io::duplex(1024);
		let target = SocksAddr::from_str("10.0.0.1:22").unwrap();
		let (reply, res) = tokio::join!(
			client_connect(&mut client, Some(("user", "pass")), &target),
			accept(&mut server, Some(&creds))
		);
		assert_eq!(reply, CONNECT_REPLY);
		assert_eq!(res.unwrap(), target);
	}

	#[tokio::test]
	async fn test_wrong_password() {
		let creds = Credentials::new("user", "pass").unwrap();
		let (mut client, mut server) = tokio::io::duplex(1024);
		let target = SocksAddr::from_str("10.0.0.1:22").unwrap();
		let (reply, res) = tokio::join!(
			client_connect(&mut client, Some(("user", "nope")), &target),
			accept(&mut server, Some(&creds))
		);
		assert_eq!(reply, [SUB_VERS, AUTH_FAILED]);
		assert!(matches!(res.unwrap_err(), Error::FailedAuthentication));
	}

	#[tokio::test]
	async fn test_auth_required() {
		let creds = Credentials::new("user", "pass").unwrap();
		let (mut client, mut server) = tokio::io::duplex(1024);
		let target = SocksAddr::from_str("10.0.0.1:22").unwrap();
		let (reply, res) = tokio::join!(
			client_connect(&mut client, None, &target),
			accept(&mut server, Some(&creds))
		);
		assert_eq!(reply, [VER5, NO_ACCEPTABLE_METHOD]);
		assert!(matches!(res.unwrap_err(), Error::UnsupportedMethod(_)));
	}

	#[tokio::test]
	async fn test_bind_rejected() {
		let (mut client, mut server) = tokio::io::duplex(1024);
		let client_side = async {
			client.write_all(&[VER5, 1, 0]).await.unwrap();
			let mut rsp = [0_u8; 2];
			client.read_exact(&mut rsp).await.unwrap();
			let mut req = vec![VER5, CommandCode::Bind as u8, 0];
			SocksAddr::from_str("1.1.1.1:53").unwrap().write_to(&mut req);
			client.write_all(&req).await.unwrap();
			let mut reply = [0_u8; 10];
			client.read_exact(&mut reply).await.unwrap();
			reply
		};
		let (reply, res) = tokio::join!(client_side, accept(&mut server, None));
		assert_eq!(reply[1], ReplyCode::CommandNotSupported as u8);
		assert!(matches!(
			res.unwrap_err(),
			Error::UnsupportedCommand(CommandCode::Bind)
		));
	}
}

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


//! Services running on an established tunnel.
//!
//! An [`Inputer`] accepts local connections and opens sub-connections on
//! the peer, an [`Outputer`] dials the destinations the peer asks for.

mod inputer;
mod outputer;
pub mod socks5;

pub use inputer::{Inputer, InputerMode};
pub use outputer::Outputer;

use crate::{
	prelude::*,
	protocol::{ClientType, Frame, LoginFrame},
	session::{SonnyMap, TunnelCtx},
	transport::Proto,
	Error,
};
use std::{fmt, time::Duration};

/// Which end of the tunnel a peer is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
	Client,
	Server,
}

impl fmt::Display for Side {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Side::Client => f.write_str("Client"),
			Side::Server => f.write_str("Server"),
		}
	}
}

pub enum Service {
	Inputer(Arc<Inputer>),
	Outputer(Arc<Outputer>),
}

impl Service {
	/// Handles a sub-connection frame received from the tunnel.
	///
	/// # Errors
	///
	/// Returns [`Error::UnexpectedFrame`] if the frame does not belong to
	/// this kind of service.
	pub async fn process_frame(&self, frame: Frame) -> Result<(), Error> {
		match self {
			Service::Inputer(s) => s.process_frame(frame).await,
			Service::Outputer(s) => s.process_frame(frame).await,
		}
	}

	#[must_use]
	pub fn name(&self) -> &'static str {
		match self {
			Service::Inputer(_) => "Inputer",
			Service::Outputer(_) => "Outputer",
		}
	}
}

/// Starts the service `side` runs for the login `login`.
///
/// # Errors
///
/// Returns an error if the login asks for an unsupported protocol or the
/// local listener cannot be bound.
pub async fn ini_service(side: Side, login: &LoginFrame, ctx: &TunnelCtx) -> Result<Service, Error> {
	let proto = Proto::try_from(login.proxy_proto).map_err(|e| Error::Other(Box::new(e)))?;
	let ctx = ctx.clone();
	let service = match (side, login.client_type) {
		(Side::Client, ClientType::Proxy) | (Side::Server, ClientType::ReverseProxy) => {
			let mode = InputerMode::Proxy(login.to_addr.clone());
			Service::Inputer(Inputer::start(ctx, proto, &login.from_addr, mode).await?)
		}
		(Side::Client, ClientType::Socks5) | (Side::Server, ClientType::ReverseSocks5) => {
			let mode = InputerMode::Socks5;
			Service::Inputer(Inputer::start(ctx, proto, &login.from_addr, mode).await?)
		}
		(Side::Server, ClientType::Proxy) | (Side::Client, ClientType::ReverseProxy) => {
			Service::Outputer(Outputer::new(ctx, proto, Some(login.to_addr.clone())))
		}
		(Side::Server, ClientType::Socks5) | (Side::Client, ClientType::ReverseSocks5) => {
			Service::Outputer(Outputer::new(ctx, proto, None))
		}
	};
	info!(
		"{} iniService {} {} ({} -> {})",
		side,
		service.name(),
		login.client_type,
		login.from_addr,
		login.to_addr
	);
	Ok(service)
}

/// How long the tunnel waits for a sub-connection with a full send queue.
const ROUTE_TIMEOUT: Duration = Duration::from_secs(1);

/// Delivers a DATA or CLOSE frame to the sub-connection it belongs to.
///
/// Frames for unknown ids are dropped. A sub-connection that cannot take
/// a frame within [`ROUTE_TIMEOUT`] is closed so that it never stalls
/// the tunnel.
async fn route(sonnies: &SonnyMap, frame: Frame) {
	let id = match frame.conn_id() {
		Some(id) => id.clone(),
		None => return,
	};
	let conn = match sonnies.get(&id) {
		Some(conn) => conn,
		None => {
			debug!("drop {} frame of unknown sub-connection {}", frame.kind(), id);
			return;
		}
	};
	if matches!(frame, Frame::Data(_)) {
		conn.actived.inc();
	}
	let sender = conn.sender();
	if sender.write_timeout(frame, ROUTE_TIMEOUT).await {
		return;
	}
	if sender.is_closed() {
		debug!("sub-connection {} is closing, frame dropped", id);
	} else {
		warn!("sub-connection {} ({}) is not reading, closing it", id, conn.info);
		conn.need_close.set(true);
		sender.close();
	}
}

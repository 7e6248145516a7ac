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


//! Dialing side of tunnels.

use crate::{
	config::Config,
	prelude::*,
	protocol::{ClientType, Frame, FrameType, LoginFrame, ProxyProto},
	service::{ini_service, Service, Side},
	session::{log_end, process_ping, process_pong, ProxyConn, Tunnel, TunnelCtx},
	transport::Conn,
	utils::{queue::QueueReceiver, Group},
	Error,
};
use parking_lot::Mutex;
use std::time::Duration;

const RECONNECT_INTERVAL: Duration = Duration::from_secs(1);

/// What a client logs in for.
#[derive(Debug, Clone)]
#[cfg_attr(
	feature = "use_serde",
	derive(serde::Deserialize),
	serde(deny_unknown_fields)
)]
pub struct ClientSettings {
	/// Address of the server.
	pub server: String,
	/// Unique name of this client on the server.
	pub name: String,
	#[cfg_attr(
		feature = "use_serde",
		serde(rename = "type", deserialize_with = "from_str")
	)]
	pub client_type: ClientType,
	#[cfg_attr(
		feature = "use_serde",
		serde(default = "default_proxy_proto", deserialize_with = "from_str")
	)]
	pub proxy_proto: ProxyProto,
	/// Listening address of the Inputer.
	#[cfg_attr(feature = "use_serde", serde(rename = "from", default))]
	pub from_addr: String,
	/// Address the Outputer dials in proxy modes.
	#[cfg_attr(feature = "use_serde", serde(rename = "to", default))]
	pub to_addr: String,
}

#[cfg(feature = "use_serde")]
const fn default_proxy_proto() -> ProxyProto {
	ProxyProto::Tcp
}

#[cfg(feature = "use_serde")]
fn from_str<'de, D, T>(d: D) -> Result<T, D::Error>
where
	D: serde::Deserializer<'de>,
	T: FromStr,
	T::Err: std::fmt::Display,
{
	let s = <String as serde::Deserialize>::deserialize(d)?;
	T::from_str(&s).map_err(serde::de::Error::custom)
}

impl ClientSettings {
	fn login(&self, key: &str) -> LoginFrame {
		LoginFrame {
			proxy_proto: self.proxy_proto,
			client_type: self.client_type,
			from_addr: self.from_addr.clone(),
			to_addr: self.to_addr.clone(),
			name: self.name.clone(),
			key: key.to_owned(),
		}
	}
}

/// Keeps one tunnel to the server alive.
pub struct Client {
	conf: Arc<Config>,
	settings: ClientSettings,
	group: Group,
	current: Mutex<Option<Arc<ProxyConn>>>,
}

impl Client {
	/// Creates a client without dialing.
	#[must_use]
	pub fn new(conf: Arc<Config>, settings: ClientSettings) -> Arc<Self> {
		Arc::new(Self {
			conf,
			settings,
			group: Group::new(),
			current: Mutex::new(None),
		})
	}

	/// Creates a client that dials the server right away, and again
	/// every second while no tunnel is alive.
	#[must_use]
	pub fn start(conf: Arc<Config>, settings: ClientSettings) -> Arc<Self> {
		let client = Self::new(conf, settings);
		client.group.go(
			format!("Client connect {}", client.settings.server),
			client.clone().connect_loop(),
		);
		client
	}

	/// Returns `true` if the current tunnel is logged in.
	#[must_use]
	pub fn is_established(&self) -> bool {
		self.current
			.lock()
			.as_ref()
			.map_or(false, |c| c.established.is_set())
	}

	/// Closes the tunnel and stops reconnecting.
	pub async fn close(&self) {
		self.group.stop();
		if let Err(e) = self.group.wait().await {
			debug!("Client closed ({})", e);
		}
	}

	async fn connect_loop(self: Arc<Self>) -> Result<(), Error> {
		loop {
			match self
				.conf
				.proto
				.dial(&self.settings.server, self.conf.connect_timeout)
				.await
			{
				Ok(conn) => {
					// Already logged by the tunnel.
					let _ = self.use_server(conn).await;
				}
				Err(e) => warn!("Client dial {} failed ({})", self.settings.server, e),
			}
			tokio::time::sleep(RECONNECT_INTERVAL).await;
		}
	}

	/// Logs in over `conn` and serves until the tunnel ends.
	///
	/// # Errors
	///
	/// Returns the reason the tunnel ended.
	pub async fn use_server(&self, conn: Conn) -> Result<(), Arc<Error>> {
		let info = conn.info().to_owned();
		info!("Client tunnel {} to {}", info, self.settings.server);
		let Tunnel { ctx, recv } = Tunnel::start(&self.group, conn, self.conf.clone(), "Client");
		*self.current.lock() = Some(ctx.father.clone());

		let login = self.settings.login(&self.conf.key);
		if !ctx.father.send(Frame::Login(login.clone())).await {
			debug!("cannot send LOGIN, tunnel {} is closing", info);
		}
		ctx.group.go(
			format!("Client process {}", info),
			process(ctx.clone(), recv, login),
		);

		let res = ctx.group.wait().await;
		{
			let mut current = self.current.lock();
			if current
				.as_ref()
				.map_or(false, |c| Arc::ptr_eq(c, &ctx.father))
			{
				*current = None;
			}
		}
		log_end("Client tunnel", &info, &res);
		res
	}
}

async fn process(
	ctx: TunnelCtx,
	mut recv: QueueReceiver<Frame>,
	login: LoginFrame,
) -> Result<(), Error> {
	let mut service: Option<Service> = None;
	while let Some(frame) = recv.read().await {
		match frame {
			Frame::LoginRsp(f) => {
				if !f.ret {
					error!("Client login of '{}' rejected ({})", login.name, f.msg);
					return Err(Error::LoginRejected(f.msg));
				}
				if service.is_some() {
					warn!("Client got another successful LOGINRSP, ignored");
					continue;
				}
				service = Some(ini_service(Side::Client, &login, &ctx).await?);
				ctx.father.established.set();
				info!(
					"Client '{}' logged in ({}) on {}",
					login.name, login.client_type, ctx.father.info
				);
			}
			Frame::Ping(f) => process_ping(f, &ctx.father).await,
			Frame::Pong(f) => process_pong(f, &ctx.father, ctx.conf.show_ping),
			Frame::Login(_) => return Err(Error::UnexpectedFrame(FrameType::Login)),
			Frame::Data(_) | Frame::Open(_) | Frame::OpenRsp(_) | Frame::Close(_) => {
				match &service {
					Some(s) => s.process_frame(frame).await?,
					None => debug!(
						"Client drop {} frame before login on {}",
						frame.kind(),
						ctx.father.info
					),
				}
			}
		}
	}
	Ok(())
}

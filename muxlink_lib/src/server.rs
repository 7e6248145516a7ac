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


//! Accepting side of tunnels.

use crate::{
	config::Config,
	prelude::*,
	protocol::{Frame, FrameType, LoginFrame},
	service::{ini_service, Service, Side},
	session::{log_end, process_ping, process_pong, Tunnel, TunnelCtx},
	transport::{Conn, Listener},
	utils::{queue::QueueReceiver, Group},
	Error,
};
use parking_lot::Mutex;
use std::{
	collections::HashMap,
	sync::atomic::{AtomicU64, Ordering},
	time::Duration,
};

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

pub const MSG_OK: &str = "ok";
pub const MSG_KEY_ERROR: &str = "key error";
pub const MSG_ESTABLISHED_BEFORE: &str = "has established before";
pub const MSG_OTHER_LOGIN: &str = "other has login before";
pub const MSG_INI_SERVICE_FAIL: &str = "iniService fail";

/// Accepts tunnels from clients and runs the services they log in for.
pub struct Server {
	conf: Arc<Config>,
	group: Group,
	/// Client name to the serial of the tunnel that registered it.
	names: Mutex<HashMap<String, u64>>,
	next_serial: AtomicU64,
	local_addr: SocketAddr,
}

impl Server {
	/// Binds `listen_addr` and starts accepting tunnels.
	///
	/// # Errors
	///
	/// Returns an error if the listener cannot be bound.
	pub async fn bind(conf: Arc<Config>, listen_addr: &str) -> Result<Arc<Self>, Error> {
		let listener = conf.proto.listen(listen_addr).await?;
		let local_addr = listener.local_addr()?;
		let server = Arc::new(Self {
			conf,
			group: Group::new(),
			names: Mutex::new(HashMap::new()),
			next_serial: AtomicU64::new(1),
			local_addr,
		});
		info!("Server listening on {} ({})", local_addr, server.conf.proto);
		server.group.go(
			format!("Server listen {}", local_addr),
			server.clone().listen(listener),
		);
		Ok(server)
	}

	#[must_use]
	pub fn local_addr(&self) -> SocketAddr {
		self.local_addr
	}

	/// Names of the logged in clients.
	#[must_use]
	pub fn client_names(&self) -> Vec<String> {
		let mut names: Vec<_> = self.names.lock().keys().cloned().collect();
		names.sort();
		names
	}

	/// Stops accepting, closes every tunnel and waits for them to end.
	pub async fn close(&self) {
		self.group.stop();
		if let Err(e) = self.group.wait().await {
			debug!("Server closed ({})", e);
		}
	}

	async fn listen(self: Arc<Self>, listener: Listener) -> Result<(), Error> {
		loop {
			match listener.accept().await {
				Ok(conn) => {
					let name = format!("Server serve {}", conn.info());
					self.group.go(name, self.clone().serve_client(conn));
				}
				Err(e) => {
					warn!("Server accept on {} failed ({})", self.local_addr, e);
					tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
				}
			}
		}
	}

	/// Runs one tunnel until it ends. Tunnel failures only get logged.
	async fn serve_client(self: Arc<Self>, conn: Conn) -> Result<(), Error> {
		let info = conn.info().to_owned();
		info!("Server accepted tunnel {}", info);
		let Tunnel { ctx, recv } = Tunnel::start(&self.group, conn, self.conf.clone(), "Server");
		let session = Arc::new(Session {
			server: self.clone(),
			ctx: ctx.clone(),
			serial: self.next_serial.fetch_add(1, Ordering::Relaxed),
			name: Mutex::new(None),
		});
		ctx.group.go(
			format!("Server process {}", info),
			session.clone().process(recv),
		);
		let res = ctx.group.wait().await;
		session.unregister();
		log_end("Server tunnel", &info, &res);
		Ok(())
	}
}

/// Login state of one accepted tunnel.
struct Session {
	server: Arc<Server>,
	ctx: TunnelCtx,
	serial: u64,
	name: Mutex<Option<String>>,
}

impl Session {
	async fn process(self: Arc<Self>, mut recv: QueueReceiver<Frame>) -> Result<(), Error> {
		let mut service: Option<Service> = None;
		while let Some(frame) = recv.read().await {
			match frame {
				Frame::Login(f) => self.process_login(f, &mut service).await,
				Frame::Ping(f) => process_ping(f, &self.ctx.father).await,
				Frame::Pong(f) => process_pong(f, &self.ctx.father, self.ctx.conf.show_ping),
				Frame::LoginRsp(_) => return Err(Error::UnexpectedFrame(FrameType::LoginRsp)),
				Frame::Data(_) | Frame::Open(_) | Frame::OpenRsp(_) | Frame::Close(_) => {
					match &service {
						Some(s) => s.process_frame(frame).await?,
						None => debug!(
							"Server drop {} frame before login on {}",
							frame.kind(),
							self.ctx.father.info
						),
					}
				}
			}
		}
		Ok(())
	}

	async fn process_login(&self, f: LoginFrame, service: &mut Option<Service>) {
		let info = &self.ctx.father.info;
		let (ret, msg) = if f.key != self.ctx.conf.key {
			warn!("Server login of '{}' on {} with wrong key", f.name, info);
			(false, MSG_KEY_ERROR)
		} else if service.is_some() {
			warn!("Server duplicate login of '{}' on {}", f.name, info);
			(false, MSG_ESTABLISHED_BEFORE)
		} else if !self.register(&f.name) {
			warn!("Server client '{}' already logged in elsewhere", f.name);
			(false, MSG_OTHER_LOGIN)
		} else {
			match ini_service(Side::Server, &f, &self.ctx).await {
				Ok(s) => {
					*service = Some(s);
					self.ctx.father.established.set();
					info!(
						"Server login of '{}' ({}) on {}",
						f.name, f.client_type, info
					);
					(true, MSG_OK)
				}
				Err(e) => {
					error!("Server iniService for '{}' failed ({})", f.name, e);
					self.unregister();
					(false, MSG_INI_SERVICE_FAIL)
				}
			}
		};
		if !self.ctx.father.send(Frame::login_rsp(ret, msg)).await {
			debug!("cannot send LOGINRSP, tunnel {} is closing", info);
		}
	}

	fn register(&self, name: &str) -> bool {
		let mut names = self.server.names.lock();
		match names.get(name) {
			Some(serial) if *serial != self.serial => false,
			_ => {
				names.insert(name.to_owned(), self.serial);
				*self.name.lock() = Some(name.to_owned());
				true
			}
		}
	}

	/// Removes the name of this tunnel, unless another tunnel took it over.
	fn unregister(&self) {
		if let Some(name) = self.name.lock().take() {
			let mut names = self.server.names.lock();
			if names.get(&name) == Some(&self.serial) {
				names.remove(&name);
			}
		}
	}
}

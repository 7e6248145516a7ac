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


use super::{route, socks5};
use crate::{
	prelude::*,
	protocol::{Frame, OpenFrame, OpenRspFrame},
	session::{close_remote_conn, log_end, SonnyMap, Sonny, TunnelCtx},
	transport::{Conn, Listener, Proto},
	utils::id::{IdSource, SequentialIds},
	Error,
};
use std::time::Duration;

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// What an [`Inputer`] asks the peer to dial.
#[derive(Debug, Clone)]
pub enum InputerMode {
	/// Always the same address.
	Proxy(String),
	/// The destination of a local SOCKS5 handshake.
	Socks5,
}

/// Accepts local connections and relays each of them through the tunnel
/// as a sub-connection.
pub struct Inputer {
	ctx: TunnelCtx,
	mode: InputerMode,
	credentials: Option<socks5::Credentials>,
	sonnies: SonnyMap,
	ids: Arc<dyn IdSource>,
	local_addr: SocketAddr,
}

impl Inputer {
	/// Binds `listen_addr` and starts accepting in the tunnel group.
	///
	/// # Errors
	///
	/// Returns an error if the listener cannot be bound.
	pub async fn start(
		ctx: TunnelCtx,
		proto: Proto,
		listen_addr: &str,
		mode: InputerMode,
	) -> Result<Arc<Self>, Error> {
		Self::start_with_ids(ctx, proto, listen_addr, mode, Arc::new(SequentialIds::new())).await
	}

	/// Same as [`Inputer::start`] with sub-connection ids taken from `ids`.
	///
	/// # Errors
	///
	/// Returns an error if the listener cannot be bound.
	pub async fn start_with_ids(
		ctx: TunnelCtx,
		proto: Proto,
		listen_addr: &str,
		mode: InputerMode,
		ids: Arc<dyn IdSource>,
	) -> Result<Arc<Self>, Error> {
		let listener = proto.listen(listen_addr).await?;
		let local_addr = listener.local_addr()?;
		let credentials = socks5::Credentials::new(&ctx.conf.username, &ctx.conf.password);
		let inputer = Arc::new(Self {
			ctx,
			mode,
			credentials,
			sonnies: SonnyMap::default(),
			ids,
			local_addr,
		});
		info!("Inputer listening on {} ({:?})", local_addr, inputer.mode);
		inputer.ctx.group.go(
			format!("Inputer listen {}", local_addr),
			inputer.clone().listen(listener),
		);
		Ok(inputer)
	}

	#[must_use]
	pub fn local_addr(&self) -> SocketAddr {
		self.local_addr
	}

	/// Number of live sub-connections.
	#[must_use]
	pub fn conn_count(&self) -> usize {
		self.sonnies.len()
	}

	/// # Errors
	///
	/// Returns [`Error::UnexpectedFrame`] for frames an Inputer never
	/// receives.
	pub async fn process_frame(&self, frame: Frame) -> Result<(), Error> {
		match frame {
			Frame::Data(_) | Frame::Close(_) => {
				route(&self.sonnies, frame).await;
				Ok(())
			}
			Frame::OpenRsp(f) => {
				self.process_open_rsp(&f);
				Ok(())
			}
			other => Err(Error::UnexpectedFrame(other.kind())),
		}
	}

	fn process_open_rsp(&self, f: &OpenRspFrame) {
		let conn = match self.sonnies.get(&f.id) {
			Some(conn) => conn,
			None => {
				debug!("drop OPENRSP of unknown sub-connection {}", f.id);
				return;
			}
		};
		if f.ret {
			debug!("Inputer sub-connection {} established", f.id);
			conn.established.set();
		} else {
			warn!("Inputer sub-connection {} refused by peer ({})", f.id, f.msg);
			conn.need_close.set(true);
		}
	}

	async fn listen(self: Arc<Self>, listener: Listener) -> Result<(), Error> {
		loop {
			match listener.accept().await {
				Ok(conn) => {
					trace!("Inputer accepted {}", conn.info());
					let name = format!("Inputer process {}", conn.info());
					self.ctx.group.go(name, self.clone().process_conn(conn));
				}
				Err(e) => {
					warn!("Inputer accept on {} failed ({})", self.local_addr, e);
					tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
				}
			}
		}
	}

	/// Failures of a single local connection never end the tunnel.
	async fn process_conn(self: Arc<Self>, conn: Conn) -> Result<(), Error> {
		let (conn, target) = match &self.mode {
			InputerMode::Proxy(target) => (conn, target.clone()),
			InputerMode::Socks5 => {
				let info = conn.info().to_owned();
				match self.socks5_handshake(conn).await {
					Ok(v) => v,
					Err(e) => {
						warn!("Inputer socks5 handshake with {} failed ({})", info, e);
						return Ok(());
					}
				}
			}
		};
		self.process_proxy_conn(conn, target).await;
		Ok(())
	}

	async fn socks5_handshake(&self, conn: Conn) -> Result<(Conn, String), Error> {
		let info = conn.info().to_owned();
		let mut stream = conn.into_inner();
		let addr = tokio::time::timeout(
			self.ctx.conf.established_timeout,
			socks5::accept(&mut stream, self.credentials.as_ref()),
		)
		.await
		.map_err(|_| socks5::Error::Timeout)??;
		Ok((Conn::new(stream, info), addr.to_string()))
	}

	async fn process_proxy_conn(&self, conn: Conn, target: String) {
		let id = self.ids.next_id();
		let sonny = Sonny::new(id.clone(), conn.info(), &self.ctx.conf);
		let sub = sonny.conn.clone();
		if !self.sonnies.insert_if_absent(sub.clone()) {
			error!(
				"Inputer sub-connection id {} already in use, drop {}",
				id,
				conn.info()
			);
			return;
		}
		let open = Frame::Open(OpenFrame {
			id: id.clone(),
			to_addr: target,
		});
		if !self.ctx.father.send(open).await {
			self.sonnies.remove(&sub);
			return;
		}
		debug!("Inputer open {} for {}", id, sub.info);

		let group = sonny.run(&self.ctx, conn, "Inputer");
		let res = group.wait().await;
		self.sonnies.remove(&sub);
		close_remote_conn(id, &self.ctx.father).await;
		log_end("Inputer conn", &sub.info, &res);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		config::Config,
		protocol::{CloseFrame, DataFrame},
		session::ProxyConn,
		utils::{
			queue::{self, QueueReceiver},
			Group,
		},
	};
	use tokio::net::TcpStream;

	const WAIT: Duration = Duration::from_secs(5);

	fn new_ctx() -> (TunnelCtx, QueueReceiver<Frame>) {
		new_ctx_with(Config::default())
	}

	fn new_ctx_with(conf: Config) -> (TunnelCtx, QueueReceiver<Frame>) {
		let (tx, rx) = queue::channel(64);
		let ctx = TunnelCtx {
			conf: Arc::new(conf),
			father: Arc::new(ProxyConn::new(Tag::default(), "test tunnel", tx)),
			group: Group::new(),
		};
		(ctx, rx)
	}

	async fn next_frame(rx: &mut QueueReceiver<Frame>) -> Frame {
		tokio::time::timeout(WAIT, rx.read()).await.unwrap().unwrap()
	}

	fn data(id: &Tag, index: u32, bytes: &[u8]) -> Frame {
		Frame::Data(DataFrame {
			id: id.clone(),
			data: bytes.to_vec(),
			compressed: false,
			crc: crc::crc32::checksum_ieee(bytes),
			index,
		})
	}

	struct FixedId;

	impl IdSource for FixedId {
		fn next_id(&self) -> Tag {
			"same".into()
		}
	}

	#[tokio::test]
	async fn test_proxy_conn_lifecycle() {
		let (ctx, mut rx) = new_ctx();
		let group = ctx.group.clone();
		let mode = InputerMode::Proxy("127.0.0.1:9000".into());
		let inputer = Inputer::start(ctx, Proto::Tcp, "127.0.0.1:0", mode)
			.await
			.unwrap();
		let mut client = TcpStream::connect(inputer.local_addr()).await.unwrap();

		let id = match next_frame(&mut rx).await {
			Frame::Open(f) => {
				assert_eq!(f.to_addr, "127.0.0.1:9000");
				f.id
			}
			other => panic!("unexpected frame {:?}", other),
		};
		assert_eq!(inputer.conn_count(), 1);

		// Held back until the peer accepts the sub-connection.
		client.write_all(b"hello").await.unwrap();
		assert!(tokio::time::timeout(Duration::from_millis(100), rx.read())
			.await
			.is_err());

		inputer
			.process_frame(Frame::open_rsp(id.clone(), true, "ok"))
			.await
			.unwrap();
		match next_frame(&mut rx).await {
			Frame::Data(f) => {
				assert_eq!(f.id, id);
				assert_eq!(f.data, b"hello");
				assert_eq!(f.index, 1);
			}
			other => panic!("unexpected frame {:?}", other),
		}

		inputer.process_frame(data(&id, 1, b"world")).await.unwrap();
		let mut buf = [0_u8; 5];
		client.read_exact(&mut buf).await.unwrap();
		assert_eq!(&buf, b"world");

		drop(client);
		match next_frame(&mut rx).await {
			Frame::Close(f) => assert_eq!(f.id, id),
			other => panic!("unexpected frame {:?}", other),
		}
		assert_eq!(inputer.conn_count(), 0);
		group.stop();
		group.wait().await.unwrap_err();
	}

	#[tokio::test]
	async fn test_remote_close() {
		let (ctx, mut rx) = new_ctx();
		let group = ctx.group.clone();
		let mode = InputerMode::Proxy("127.0.0.1:9000".into());
		let inputer = Inputer::start(ctx, Proto::Tcp, "127.0.0.1:0", mode)
			.await
			.unwrap();
		let mut client = TcpStream::connect(inputer.local_addr()).await.unwrap();
		let id = match next_frame(&mut rx).await {
			Frame::Open(f) => f.id,
			other => panic!("unexpected frame {:?}", other),
		};
		inputer
			.process_frame(Frame::open_rsp(id.clone(), true, "ok"))
			.await
			.unwrap();
		inputer.process_frame(data(&id, 1, b"bye")).await.unwrap();
		inputer
			.process_frame(Frame::Close(CloseFrame { id: id.clone() }))
			.await
			.unwrap();

		let mut buf = Vec::new();
		tokio::time::timeout(WAIT, client.read_to_end(&mut buf))
			.await
			.unwrap()
			.unwrap();
		assert_eq!(buf, b"bye");
		group.stop();
	}

	#[tokio::test]
	async fn test_open_refused() {
		let (ctx, mut rx) = new_ctx();
		let group = ctx.group.clone();
		let mode = InputerMode::Proxy("127.0.0.1:1".into());
		let inputer = Inputer::start(ctx, Proto::Tcp, "127.0.0.1:0", mode)
			.await
			.unwrap();
		let mut client = TcpStream::connect(inputer.local_addr()).await.unwrap();
		let id = match next_frame(&mut rx).await {
			Frame::Open(f) => f.id,
			other => panic!("unexpected frame {:?}", other),
		};
		client.write_all(b"never relayed").await.unwrap();
		inputer
			.process_frame(Frame::open_rsp(id.clone(), false, "Dial fail 127.0.0.1:1"))
			.await
			.unwrap();

		let mut buf = Vec::new();
		let n = tokio::time::timeout(WAIT, client.read_to_end(&mut buf))
			.await
			.unwrap()
			.unwrap_or(0);
		assert_eq!(n, 0);
		match next_frame(&mut rx).await {
			Frame::Close(f) => assert_eq!(f.id, id),
			other => panic!("unexpected frame {:?}", other),
		}
		group.stop();
	}

	#[tokio::test]
	async fn test_id_collision_drops_new_conn() {
		let (ctx, mut rx) = new_ctx();
		let group = ctx.group.clone();
		let mode = InputerMode::Proxy("127.0.0.1:9000".into());
		let inputer =
			Inputer::start_with_ids(ctx, Proto::Tcp, "127.0.0.1:0", mode, Arc::new(FixedId))
				.await
				.unwrap();
		let _first = TcpStream::connect(inputer.local_addr()).await.unwrap();
		assert!(matches!(next_frame(&mut rx).await, Frame::Open(_)));

		let mut second = TcpStream::connect(inputer.local_addr()).await.unwrap();
		let mut buf = [0_u8; 1];
		let n = tokio::time::timeout(WAIT, second.read(&mut buf))
			.await
			.unwrap()
			.unwrap_or(0);
		assert_eq!(n, 0);
		assert_eq!(inputer.conn_count(), 1);
		assert!(tokio::time::timeout(Duration::from_millis(100), rx.read())
			.await
			.is_err());
		group.stop();
	}

	#[tokio::test]
	async fn test_stalled_local_client_does_not_block_dispatch() {
		let conf = Config {
			conn_buffer: 2,
			..Config::default()
		};
		let (ctx, mut rx) = new_ctx_with(conf);
		let group = ctx.group.clone();
		let mode = InputerMode::Proxy("127.0.0.1:9000".into());
		let inputer = Inputer::start(ctx, Proto::Tcp, "127.0.0.1:0", mode)
			.await
			.unwrap();
		// Never reads.
		let _client = TcpStream::connect(inputer.local_addr()).await.unwrap();
		let id = match next_frame(&mut rx).await {
			Frame::Open(f) => f.id,
			other => panic!("unexpected frame {:?}", other),
		};
		inputer
			.process_frame(Frame::open_rsp(id.clone(), true, "ok"))
			.await
			.unwrap();

		let chunk = vec![7_u8; 256 * 1024];
		for index in 1..=128 {
			tokio::time::timeout(WAIT, inputer.process_frame(data(&id, index, &chunk)))
				.await
				.unwrap()
				.unwrap();
		}
		match next_frame(&mut rx).await {
			Frame::Close(f) => assert_eq!(f.id, id),
			other => panic!("unexpected frame {:?}", other),
		}
		assert_eq!(inputer.conn_count(), 0);
		group.stop();
	}

	#[tokio::test]
	async fn test_unexpected_frame() {
		let (ctx, _rx) = new_ctx();
		let group = ctx.group.clone();
		let mode = InputerMode::Proxy("127.0.0.1:9000".into());
		let inputer = Inputer::start(ctx, Proto::Tcp, "127.0.0.1:0", mode)
			.await
			.unwrap();
		let open = Frame::Open(OpenFrame {
			id: "x".into(),
			to_addr: String::new(),
		});
		assert!(matches!(
			inputer.process_frame(open).await,
			Err(Error::UnexpectedFrame(_))
		));
		// Unknown ids are not fatal.
		inputer.process_frame(data(&"x".into(), 1, b"a")).await.unwrap();
		group.stop();
	}
}

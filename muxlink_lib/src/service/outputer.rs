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


use super::route;
use crate::{
	prelude::*,
	protocol::{Frame, OpenFrame},
	session::{close_remote_conn, log_end, SonnyMap, Sonny, TunnelCtx},
	transport::{Conn, Proto},
	Error,
};
use parking_lot::Mutex;

/// Dials a destination for every OPEN received from the tunnel.
pub struct Outputer {
	ctx: TunnelCtx,
	proto: Proto,
	/// Dialed instead of the address in OPEN when set.
	target: Option<String>,
	sonnies: SonnyMap,
}

impl Outputer {
	#[must_use]
	pub fn new(ctx: TunnelCtx, proto: Proto, target: Option<String>) -> Arc<Self> {
		Arc::new(Self {
			ctx,
			proto,
			target,
			sonnies: SonnyMap::default(),
		})
	}

	/// Number of live sub-connections.
	#[must_use]
	pub fn conn_count(&self) -> usize {
		self.sonnies.len()
	}

	/// # Errors
	///
	/// Returns [`Error::UnexpectedFrame`] for frames an Outputer never
	/// receives.
	pub async fn process_frame(self: &Arc<Self>, frame: Frame) -> Result<(), Error> {
		match frame {
			Frame::Data(_) | Frame::Close(_) => {
				route(&self.sonnies, frame).await;
				Ok(())
			}
			Frame::Open(f) => {
				let name = format!("Outputer open {}", f.id);
				self.ctx.group.go(name, self.clone().process_open(f));
				Ok(())
			}
			other => Err(Error::UnexpectedFrame(other.kind())),
		}
	}

	/// Failures of a single sub-connection never end the tunnel.
	async fn process_open(self: Arc<Self>, f: OpenFrame) -> Result<(), Error> {
		let addr = match &self.target {
			Some(target) => target.clone(),
			None => f.to_addr,
		};
		let conn = match self.dial(&addr).await {
			Ok(conn) => conn,
			Err(e) => {
				warn!("Outputer dial {} for {} failed ({})", addr, f.id, e);
				let rsp = Frame::open_rsp(f.id, false, format!("Dial fail {}", addr));
				if !self.ctx.father.send(rsp).await {
					debug!("cannot send OPENRSP, tunnel is closing");
				}
				return Ok(());
			}
		};

		let sonny = Sonny::new(f.id.clone(), conn.info(), &self.ctx.conf);
		let sub = sonny.conn.clone();
		sub.established.set();
		if !self.sonnies.insert_if_absent(sub.clone()) {
			error!(
				"Outputer sub-connection id {} already in use, drop {}",
				f.id,
				conn.info()
			);
			let rsp = Frame::open_rsp(f.id, false, "id in use");
			if !self.ctx.father.send(rsp).await {
				debug!("cannot send OPENRSP, tunnel is closing");
			}
			return Ok(());
		}
		if !self.ctx.father.send(Frame::open_rsp(f.id.clone(), true, "ok")).await {
			self.sonnies.remove(&sub);
			return Ok(());
		}
		debug!("Outputer open {} to {} ({})", f.id, addr, sub.info);

		let group = sonny.run(&self.ctx, conn, "Outputer");
		let res = group.wait().await;
		self.sonnies.remove(&sub);
		close_remote_conn(f.id, &self.ctx.father).await;
		log_end("Outputer conn", &sub.info, &res);
		Ok(())
	}

	/// Dials `addr` in its own group so that closing the tunnel aborts it.
	async fn dial(&self, addr: &str) -> Result<Conn, Arc<Error>> {
		let slot = Arc::new(Mutex::new(None));
		let dialer = self.ctx.group.son(|| {});
		{
			let slot = slot.clone();
			let proto = self.proto;
			let timeout = self.ctx.conf.connect_timeout;
			let addr = addr.to_owned();
			dialer.go(format!("Outputer dial {}", addr), async move {
				let conn = proto.dial(&addr, timeout).await?;
				*slot.lock() = Some(conn);
				Ok(())
			});
		}
		dialer.wait().await?;
		let conn = slot.lock().take();
		conn.ok_or_else(|| Arc::new(Error::Stop))
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
	use std::time::Duration;
	use tokio::net::TcpListener;

	const WAIT: Duration = Duration::from_secs(5);

	fn new_ctx() -> (TunnelCtx, QueueReceiver<Frame>) {
		let (tx, rx) = queue::channel(64);
		let ctx = TunnelCtx {
			conf: Arc::new(Config::default()),
			father: Arc::new(ProxyConn::new(Tag::default(), "test tunnel", tx)),
			group: Group::new(),
		};
		(ctx, rx)
	}

	async fn next_frame(rx: &mut QueueReceiver<Frame>) -> Frame {
		tokio::time::timeout(WAIT, rx.read()).await.unwrap().unwrap()
	}

	fn data(id: &str, index: u32, bytes: &[u8]) -> Frame {
		Frame::Data(DataFrame {
			id: id.into(),
			data: bytes.to_vec(),
			compressed: false,
			crc: crc::crc32::checksum_ieee(bytes),
			index,
		})
	}

	fn open(id: &str, to_addr: &str) -> Frame {
		Frame::Open(OpenFrame {
			id: id.into(),
			to_addr: to_addr.into(),
		})
	}

	async fn unused_addr() -> String {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		listener.local_addr().unwrap().to_string()
	}

	#[tokio::test]
	async fn test_open_and_relay() {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let target = listener.local_addr().unwrap().to_string();
		let (ctx, mut rx) = new_ctx();
		let group = ctx.group.clone();
		let outputer = Outputer::new(ctx, Proto::Tcp, Some(target));

		// The OPEN address is ignored for static targets.
		outputer.process_frame(open("a", "10.255.255.1:1")).await.unwrap();
		let (mut remote, _) = listener.accept().await.unwrap();
		match next_frame(&mut rx).await {
			Frame::OpenRsp(f) => {
				assert_eq!(f.id, "a");
				assert!(f.ret);
				assert_eq!(f.msg, "ok");
			}
			other => panic!("unexpected frame {:?}", other),
		}
		assert_eq!(outputer.conn_count(), 1);

		outputer.process_frame(data("a", 1, b"ping")).await.unwrap();
		let mut buf = [0_u8; 4];
		remote.read_exact(&mut buf).await.unwrap();
		assert_eq!(&buf, b"ping");

		remote.write_all(b"pong").await.unwrap();
		match next_frame(&mut rx).await {
			Frame::Data(f) => {
				assert_eq!(f.id, "a");
				assert_eq!(f.data, b"pong");
				assert_eq!(f.index, 1);
			}
			other => panic!("unexpected frame {:?}", other),
		}

		outputer
			.process_frame(Frame::Close(CloseFrame { id: "a".into() }))
			.await
			.unwrap();
		let mut rest = Vec::new();
		tokio::time::timeout(WAIT, remote.read_to_end(&mut rest))
			.await
			.unwrap()
			.unwrap();
		assert!(rest.is_empty());
		match next_frame(&mut rx).await {
			Frame::Close(f) => assert_eq!(f.id, "a"),
			other => panic!("unexpected frame {:?}", other),
		}
		assert_eq!(outputer.conn_count(), 0);
		group.stop();
	}

	#[tokio::test]
	async fn test_dynamic_target() {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let target = listener.local_addr().unwrap().to_string();
		let (ctx, mut rx) = new_ctx();
		let group = ctx.group.clone();
		let outputer = Outputer::new(ctx, Proto::Tcp, None);

		outputer.process_frame(open("s", &target)).await.unwrap();
		let (_remote, _) = listener.accept().await.unwrap();
		assert!(matches!(next_frame(&mut rx).await, Frame::OpenRsp(f) if f.ret));
		group.stop();
	}

	#[tokio::test]
	async fn test_dial_failure() {
		let target = unused_addr().await;
		let (ctx, mut rx) = new_ctx();
		let group = ctx.group.clone();
		let outputer = Outputer::new(ctx, Proto::Tcp, None);

		outputer.process_frame(open("b", &target)).await.unwrap();
		match next_frame(&mut rx).await {
			Frame::OpenRsp(f) => {
				assert_eq!(f.id, "b");
				assert!(!f.ret);
				assert_eq!(f.msg, format!("Dial fail {}", target));
			}
			other => panic!("unexpected frame {:?}", other),
		}
		assert_eq!(outputer.conn_count(), 0);
		// The tunnel survives.
		assert!(!group.is_exited());
		group.stop();
	}

	#[tokio::test]
	async fn test_id_in_use_refused() {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let target = listener.local_addr().unwrap().to_string();
		let (ctx, mut rx) = new_ctx();
		let group = ctx.group.clone();
		let outputer = Outputer::new(ctx, Proto::Tcp, Some(target));

		outputer.process_frame(open("dup", "")).await.unwrap();
		let (_first, _) = listener.accept().await.unwrap();
		assert!(matches!(next_frame(&mut rx).await, Frame::OpenRsp(f) if f.ret));

		outputer.process_frame(open("dup", "")).await.unwrap();
		let (mut second, _) = listener.accept().await.unwrap();
		match next_frame(&mut rx).await {
			Frame::OpenRsp(f) => {
				assert_eq!(f.id, "dup");
				assert!(!f.ret);
			}
			other => panic!("unexpected frame {:?}", other),
		}
		let mut buf = Vec::new();
		let n = tokio::time::timeout(WAIT, second.read_to_end(&mut buf))
			.await
			.unwrap()
			.unwrap_or(0);
		assert_eq!(n, 0);
		assert_eq!(outputer.conn_count(), 1);
		group.stop();
	}

	#[tokio::test]
	async fn test_unknown_id_and_unexpected_frame() {
		let (ctx, _rx) = new_ctx();
		let group = ctx.group.clone();
		let outputer = Outputer::new(ctx, Proto::Tcp, None);
		outputer.process_frame(data("nobody", 1, b"x")).await.unwrap();
		outputer
			.process_frame(Frame::Close(CloseFrame { id: "nobody".into() }))
			.await
			.unwrap();
		assert!(matches!(
			outputer
				.process_frame(Frame::open_rsp("c".into(), true, "ok"))
				.await,
			Err(Error::UnexpectedFrame(_))
		));
		group.stop();
	}
}

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


//! Per-connection state shared by tunnels and sub-connections.

mod pump;
mod supervisor;

pub use pump::{copy_sonny_recv, recv_from, recv_from_sonny, send_to, send_to_sonny};
pub use supervisor::{
	check_need_close, check_ping_active, check_sonny_active, process_ping, process_pong,
};

use crate::{
	config::Config,
	prelude::*,
	protocol::{CloseFrame, Codec, Frame},
	transport::Conn,
	utils::{
		queue::{self, QueueReceiver, QueueSender},
		Counter, Group, Signal, Switch,
	},
	Error,
};
use parking_lot::Mutex;
use std::collections::HashMap;

/// One endpoint of a tunnel or of a sub-connection.
pub struct ProxyConn {
	/// Empty for tunnels.
	pub id: Tag,
	pub info: String,
	pub established: Signal,
	pub need_close: Switch,
	/// DATA frames seen since the last activity check.
	pub actived: Counter,
	/// Pings sent without an answer.
	pub pinged: Counter,
	sender: QueueSender<Frame>,
}

impl ProxyConn {
	/// `sender` is the queue of frames to be written to this endpoint.
	pub fn new(id: Tag, info: impl Into<String>, sender: QueueSender<Frame>) -> Self {
		Self {
			id,
			info: info.into(),
			established: Signal::new(),
			need_close: Switch::new(false),
			actived: Counter::new(0),
			pinged: Counter::new(0),
			sender,
		}
	}

	/// Queues `frame` for this endpoint.
	///
	/// Returns `false` if the endpoint is closing.
	pub async fn send(&self, frame: Frame) -> bool {
		self.sender.write(frame).await
	}

	#[inline]
	#[must_use]
	pub fn sender(&self) -> &QueueSender<Frame> {
		&self.sender
	}
}

impl std::fmt::Debug for ProxyConn {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ProxyConn")
			.field("id", &self.id)
			.field("info", &self.info)
			.field("established", &self.established.is_set())
			.finish()
	}
}

/// Live sub-connections of one Inputer or Outputer, by id.
#[derive(Default)]
pub struct SonnyMap {
	inner: Mutex<HashMap<Tag, Arc<ProxyConn>>>,
}

impl SonnyMap {
	/// Inserts `conn` unless its id is already taken.
	///
	/// Returns `false` on collision, leaving the map untouched.
	pub fn insert_if_absent(&self, conn: Arc<ProxyConn>) -> bool {
		let mut map = self.inner.lock();
		if map.contains_key(&conn.id) {
			return false;
		}
		map.insert(conn.id.clone(), conn);
		true
	}

	#[must_use]
	pub fn get(&self, id: &str) -> Option<Arc<ProxyConn>> {
		self.inner.lock().get(id).cloned()
	}

	/// Removes the entry of `conn`, only if it is still `conn` itself.
	pub fn remove(&self, conn: &Arc<ProxyConn>) -> bool {
		let mut map = self.inner.lock();
		match map.get(&conn.id) {
			Some(current) if Arc::ptr_eq(current, conn) => {
				map.remove(&conn.id);
				true
			}
			_ => false,
		}
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.inner.lock().len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.inner.lock().is_empty()
	}
}

/// What a service needs from the tunnel it runs on.
#[derive(Clone)]
pub struct TunnelCtx {
	pub conf: Arc<Config>,
	/// Tunnel endpoint. Frames sent to it go over the wire.
	pub father: Arc<ProxyConn>,
	pub group: Group,
}

/// A running tunnel and the queue of frames it received.
pub struct Tunnel {
	pub ctx: TunnelCtx,
	pub recv: QueueReceiver<Frame>,
}

impl Tunnel {
	/// Starts the wire pumps and liveness checks of `conn` in a son of
	/// `father_group`.
	///
	/// The caller is expected to consume [`Tunnel::recv`] in a task of
	/// `ctx.group` and then wait on it.
	pub fn start(father_group: &Group, conn: Conn, conf: Arc<Config>, role: &str) -> Self {
		let (send_tx, send_rx) = queue::channel(conf.main_buffer);
		let (recv_tx, recv_rx) = queue::channel(conf.main_buffer);
		let group = {
			let send_tx = send_tx.clone();
			let recv_tx = recv_tx.clone();
			father_group.son(move || {
				send_tx.close();
				recv_tx.close();
			})
		};
		let father = Arc::new(ProxyConn::new(Tag::default(), conn.info(), send_tx));
		let codec = Arc::new(Codec::from_config(&conf));
		let info = father.info.clone();
		let (r, w) = conn.split();

		group.go(
			format!("{} recvFrom {}", role, info),
			recv_from(r, codec.clone(), recv_tx),
		);
		group.go(format!("{} sendTo {}", role, info), send_to(w, codec, send_rx));
		group.go(
			format!("{} checkPingActive {}", role, info),
			check_ping_active(father.clone(), conf.clone()),
		);
		group.go(
			format!("{} checkNeedClose {}", role, info),
			check_need_close(father.clone()),
		);

		Self {
			ctx: TunnelCtx {
				conf,
				father,
				group,
			},
			recv: recv_rx,
		}
	}
}

/// A sub-connection whose relay tasks are not started yet.
pub struct Sonny {
	pub conn: Arc<ProxyConn>,
	send_rx: QueueReceiver<Frame>,
	recv_tx: QueueSender<Frame>,
	recv_rx: QueueReceiver<Frame>,
}

impl Sonny {
	#[must_use]
	pub fn new(id: Tag, info: &str, conf: &Config) -> Self {
		let (send_tx, send_rx) = queue::channel(conf.conn_buffer);
		let (recv_tx, recv_rx) = queue::channel(conf.conn_buffer);
		Self {
			conn: Arc::new(ProxyConn::new(id, info, send_tx)),
			send_rx,
			recv_tx,
			recv_rx,
		}
	}

	/// Starts relaying between `local` and the tunnel in a son of the
	/// tunnel group, and returns that group.
	pub fn run(self, ctx: &TunnelCtx, local: Conn, role: &str) -> Group {
		let Sonny {
			conn,
			send_rx,
			recv_tx,
			recv_rx,
		} = self;
		let group = {
			let send_tx = conn.sender().clone();
			let recv_tx = recv_tx.clone();
			ctx.group.son(move || {
				send_tx.close();
				recv_tx.close();
			})
		};
		let info = conn.info.clone();
		let (r, w) = local.split();

		group.go(
			format!("{} recvFromSonny {}", role, info),
			recv_from_sonny(r, recv_tx, ctx.conf.data_chunk_size()),
		);
		group.go(
			format!("{} sendToSonny {}", role, info),
			send_to_sonny(w, send_rx),
		);
		group.go(
			format!("{} checkSonnyActive {}", role, info),
			check_sonny_active(conn.clone(), ctx.conf.clone()),
		);
		group.go(
			format!("{} checkNeedClose {}", role, info),
			check_need_close(conn.clone()),
		);
		group.go(
			format!("{} copySonnyRecv {}", role, info),
			copy_sonny_recv(recv_rx, conn, ctx.father.clone()),
		);
		group
	}
}

/// Tells the peer that sub-connection `id` is gone.
pub async fn close_remote_conn(id: Tag, father: &ProxyConn) {
	if !father.send(Frame::Close(CloseFrame { id: id.clone() })).await {
		debug!("cannot send close frame of {}, tunnel is closing", id);
	}
}

/// Logs how a tunnel or sub-connection ended.
pub fn log_end(what: &str, info: &str, res: &Result<(), Arc<Error>>) {
	match res {
		Ok(()) => info!("{} end {}", what, info),
		Err(e) if e.is_liveness() => info!("{} end {} ({})", what, info, e),
		Err(e) => warn!("{} end {} with error ({})", what, info, e),
	}
}

#[cfg(test)]
mod tests {
	use super::{ProxyConn, SonnyMap};
	use crate::{prelude::*, utils::queue};

	fn new_conn(id: &str) -> Arc<ProxyConn> {
		let (tx, _rx) = queue::channel(1);
		Arc::new(ProxyConn::new(id.into(), "test", tx))
	}

	#[test]
	fn test_sonny_map_insert_if_absent() {
		let map = SonnyMap::default();
		let first = new_conn("a");
		let second = new_conn("a");
		assert!(map.insert_if_absent(first.clone()));
		assert!(!map.insert_if_absent(second.clone()));
		assert!(Arc::ptr_eq(&map.get("a").unwrap(), &first));

		// Only the owner can remove its entry.
		assert!(!map.remove(&second));
		assert_eq!(map.len(), 1);
		assert!(map.remove(&first));
		assert!(map.is_empty());
		assert!(map.get("a").is_none());
	}
}

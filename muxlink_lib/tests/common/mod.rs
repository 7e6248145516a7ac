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


use log::error;
use muxlink_lib::{
	protocol::{ClientType, ProxyProto},
	Client, ClientSettings, Config, Server,
};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
	io::{AsyncReadExt, AsyncWriteExt},
	net::{TcpListener, TcpStream},
};

pub const WAIT: Duration = Duration::from_secs(10);

pub fn setup_logger() {
	let _ = env_logger::builder().is_test(true).try_init();
}

/// Address nothing listens on, at least right after this returns.
pub async fn free_addr() -> String {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	listener.local_addr().unwrap().to_string()
}

/// Echoes every connection back until the peer closes it.
pub async fn spawn_echo_server() -> SocketAddr {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(async move {
		loop {
			let (mut stream, _) = match listener.accept().await {
				Ok(v) => v,
				Err(e) => {
					error!("echo server accept failed ({})", e);
					return;
				}
			};
			tokio::spawn(async move {
				let (mut r, mut w) = stream.split();
				if let Err(e) = tokio::io::copy(&mut r, &mut w).await {
					error!("echo server copy failed ({})", e);
				}
			});
		}
	});
	addr
}

pub async fn wait_until(mut cond: impl FnMut() -> bool) {
	tokio::time::timeout(WAIT, async {
		while !cond() {
			tokio::time::sleep(Duration::from_millis(20)).await;
		}
	})
	.await
	.expect("condition not met in time");
}

/// A server and a client logged in to it.
pub struct Pair {
	pub server: Arc<Server>,
	pub client: Arc<Client>,
}

impl Pair {
	pub async fn start(
		conf: Config,
		client_type: ClientType,
		from_addr: &str,
		to_addr: &str,
	) -> Self {
		let conf = Arc::new(conf);
		let server = Server::bind(conf.clone(), "127.0.0.1:0").await.unwrap();
		let settings = ClientSettings {
			server: server.local_addr().to_string(),
			name: format!("{}-client", client_type),
			client_type,
			proxy_proto: ProxyProto::Tcp,
			from_addr: from_addr.into(),
			to_addr: to_addr.into(),
		};
		let client = Client::start(conf, settings);
		let pair = Self { server, client };
		let client = pair.client.clone();
		wait_until(move || client.is_established()).await;
		pair
	}

	pub async fn close(self) {
		self.client.close().await;
		self.server.close().await;
	}
}

/// Writes `data` through `stream` and expects it echoed back.
pub async fn check_echo(stream: &mut TcpStream, data: &[u8]) {
	let (mut r, mut w) = stream.split();
	let write = async {
		w.write_all(data).await.unwrap();
	};
	let read = async {
		let mut buf = vec![0_u8; data.len()];
		r.read_exact(&mut buf).await.unwrap();
		buf
	};
	let ((), echoed) = tokio::time::timeout(WAIT, async { tokio::join!(write, read) })
		.await
		.unwrap();
	assert!(echoed == data, "echoed data differs");
}

/// Some bytes that compress well, followed by some that do not.
pub fn payload(len: usize) -> Vec<u8> {
	let mut data = b"muxlink payload ".repeat(len / 32 + 1);
	data.truncate(len / 2);
	let mut x: u32 = 0x1234_5678;
	while data.len() < len {
		x ^= x << 13;
		x ^= x >> 17;
		x ^= x << 5;
		data.push(x as u8);
	}
	data
}

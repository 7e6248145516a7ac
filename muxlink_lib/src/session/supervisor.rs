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


//! Liveness checks run next to the pumps.

use super::ProxyConn;
use crate::{
	config::Config,
	prelude::*,
	protocol::{Frame, PingFrame, PongFrame},
	utils::timestamp_nanos_now,
	Error,
};
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

const POLL_INTERVAL: Duration = Duration::from_secs(1);

fn ticker(period: Duration) -> tokio::time::Interval {
	let mut t = interval_at(Instant::now() + period, period);
	t.set_missed_tick_behavior(MissedTickBehavior::Delay);
	t
}

async fn wait_established(conn: &ProxyConn, timeout: Duration) -> Result<(), Error> {
	if tokio::time::timeout(timeout, conn.established.wait())
		.await
		.is_err()
	{
		warn!("established timeout {}", conn.info);
		return Err(Error::EstablishedTimeout);
	}
	Ok(())
}

/// Fails if the tunnel is not established in time, then pings the peer
/// and fails once too many pings are unanswered.
///
/// # Errors
///
/// Returns [`Error::EstablishedTimeout`] or [`Error::PingTimeout`].
pub async fn check_ping_active(conn: Arc<ProxyConn>, conf: Arc<Config>) -> Result<(), Error> {
	wait_established(&conn, conf.established_timeout).await?;
	let mut ticker = ticker(conf.ping_inter);
	loop {
		ticker.tick().await;
		if conn.pinged.get() > conf.ping_timeout_inter {
			warn!("ping pong timeout {}", conn.info);
			return Err(Error::PingTimeout);
		}
		let ping = Frame::Ping(PingFrame {
			time: timestamp_nanos_now(),
		});
		if !conn.send(ping).await {
			return Ok(());
		}
		conn.pinged.inc();
		if conf.show_ping {
			info!("ping {}", conn.info);
		}
	}
}

/// Fails if the sub-connection is not established in time, or carries
/// no data for a whole `conn_timeout`.
///
/// # Errors
///
/// Returns [`Error::EstablishedTimeout`] or [`Error::Inactive`].
pub async fn check_sonny_active(conn: Arc<ProxyConn>, conf: Arc<Config>) -> Result<(), Error> {
	wait_established(&conn, conf.established_timeout).await?;
	let mut ticker = ticker(POLL_INTERVAL);
	let mut elapsed = Duration::ZERO;
	loop {
		ticker.tick().await;
		elapsed += POLL_INTERVAL;
		if elapsed >= conf.conn_timeout {
			if conn.actived.reset() == 0 {
				warn!("conn timeout {} {}", conn.id, conn.info);
				return Err(Error::Inactive);
			}
			elapsed = Duration::ZERO;
		}
	}
}

/// Fails once `need_close` is set.
///
/// # Errors
///
/// Returns [`Error::NeedClose`].
pub async fn check_need_close(conn: Arc<ProxyConn>) -> Result<(), Error> {
	let mut ticker = ticker(POLL_INTERVAL);
	loop {
		ticker.tick().await;
		if conn.need_close.get() {
			debug!("needclose {} {}", conn.id, conn.info);
			return Err(Error::NeedClose);
		}
	}
}

/// Answers a ping with a pong echoing its timestamp.
pub async fn process_ping(f: PingFrame, conn: &ProxyConn) {
	if !conn.send(Frame::Pong(PongFrame { time: f.time })).await {
		debug!("cannot answer ping, {} is closing", conn.info);
	}
}

pub fn process_pong(f: PongFrame, conn: &ProxyConn, show_ping: bool) {
	conn.pinged.reset();
	if show_ping {
		let rtt = Duration::from_nanos(
			u64::try_from(timestamp_nanos_now().saturating_sub(f.time)).unwrap_or(0),
		);
		info!("pong {} {:?}", conn.info, rtt);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		config::Builder,
		utils::queue::{self, QueueReceiver},
	};

	fn setup(conf: &Builder) -> (Arc<ProxyConn>, Arc<Config>, QueueReceiver<Frame>) {
		let conf = Arc::new(conf.build().unwrap());
		let (tx, rx) = queue::channel(64);
		let conn = Arc::new(ProxyConn::new("c".into(), "test", tx));
		(conn, conf, rx)
	}

	#[tokio::test(start_paused = true)]
	async fn test_established_timeout() {
		let (conn, conf, _rx) = setup(&Builder {
			established_timeout: 3,
			..Builder::default()
		});
		let start = Instant::now();
		let err = check_ping_active(conn, conf).await.unwrap_err();
		assert!(matches!(err, Error::EstablishedTimeout));
		assert_eq!(start.elapsed().as_secs(), 3);
	}

	#[tokio::test(start_paused = true)]
	async fn test_silent_peer() {
		let (conn, conf, mut rx) = setup(&Builder::default());
		conn.established.set();
		let start = Instant::now();
		let err = check_ping_active(conn, conf.clone()).await.unwrap_err();
		assert!(matches!(err, Error::PingTimeout));
		let limit = conf.ping_inter * (conf.ping_timeout_inter as u32 + 1);
		assert!(start.elapsed() > limit);
		assert!(start.elapsed() <= limit + conf.ping_inter);

		let mut pings = 0;
		while let Ok(Some(Frame::Ping(_))) =
			tokio::time::timeout(Duration::from_millis(1), rx.read()).await
		{
			pings += 1;
		}
		assert_eq!(pings, conf.ping_timeout_inter + 1);
	}

	#[tokio::test(start_paused = true)]
	async fn test_pong_keeps_alive() {
		let (conn, conf, mut rx) = setup(&Builder::default());
		conn.established.set();
		let responder = {
			let conn = conn.clone();
			async move {
				while let Some(f) = rx.read().await {
					if let Frame::Ping(p) = f {
						process_pong(PongFrame { time: p.time }, &conn, false);
					}
				}
			}
		};
		tokio::spawn(responder);
		let res =
			tokio::time::timeout(Duration::from_secs(60), check_ping_active(conn, conf)).await;
		assert!(res.is_err(), "checker should still be running");
	}

	#[tokio::test(start_paused = true)]
	async fn test_sonny_inactive() {
		let (conn, conf, _rx) = setup(&Builder {
			conn_timeout: 5,
			..Builder::default()
		});
		conn.established.set();
		let start = Instant::now();
		let err = check_sonny_active(conn, conf).await.unwrap_err();
		assert!(matches!(err, Error::Inactive));
		assert_eq!(start.elapsed().as_secs(), 5);
	}

	#[tokio::test(start_paused = true)]
	async fn test_sonny_activity_resets() {
		let (conn, conf, _rx) = setup(&Builder {
			conn_timeout: 5,
			..Builder::default()
		});
		conn.established.set();
		let checker = tokio::spawn(check_sonny_active(conn.clone(), conf));
		for _ in 0..4 {
			conn.actived.inc();
			tokio::time::sleep(Duration::from_secs(4)).await;
		}
		assert!(!checker.is_finished());
		let err = checker.await.unwrap().unwrap_err();
		assert!(matches!(err, Error::Inactive));
	}

	#[tokio::test(start_paused = true)]
	async fn test_need_close() {
		let (conn, _conf, _rx) = setup(&Builder::default());
		let checker = tokio::spawn(check_need_close(conn.clone()));
		tokio::time::sleep(Duration::from_secs(3)).await;
		assert!(!checker.is_finished());
		conn.need_close.set(true);
		let err = checker.await.unwrap().unwrap_err();
		assert!(matches!(err, Error::NeedClose));
	}

	#[tokio::test]
	async fn test_ping_answered_with_pong() {
		let (conn, _conf, mut rx) = setup(&Builder::default());
		process_ping(PingFrame { time: 42 }, &conn).await;
		assert_eq!(rx.read().await, Some(Frame::Pong(PongFrame { time: 42 })));
		conn.pinged.add(3);
		process_pong(PongFrame { time: 42 }, &conn, true);
		assert_eq!(conn.pinged.get(), 0);
	}
}

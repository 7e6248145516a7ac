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


//! Byte/frame adapters of tunnels and sub-connections.

use super::ProxyConn;
use crate::{
	prelude::*,
	protocol::{
		frame::{next_index, DataFrame},
		Codec, Frame,
	},
	transport::{BoxRead, BoxWrite},
	utils::queue::{QueueReceiver, QueueSender},
	Error,
};

/// Reads frames from the tunnel into `recv`.
///
/// # Errors
///
/// Returns an error if reading or decoding fails.
pub async fn recv_from(
	mut r: BoxRead,
	codec: Arc<Codec>,
	recv: QueueSender<Frame>,
) -> Result<(), Error> {
	loop {
		let frame = codec.read_frame(&mut r).await?;
		trace!("recvFrom {} frame", frame.kind());
		if !recv.write(frame).await {
			return Ok(());
		}
	}
}

/// Writes frames from `send` to the tunnel.
///
/// Ends with [`Error::LoginRejected`] right after a rejecting login
/// response has been written.
///
/// # Errors
///
/// Returns an error if encoding or writing fails.
pub async fn send_to(
	mut w: BoxWrite,
	codec: Arc<Codec>,
	mut send: QueueReceiver<Frame>,
) -> Result<(), Error> {
	while let Some(frame) = send.read().await {
		let rejected = match &frame {
			Frame::LoginRsp(rsp) if !rsp.ret => Some(rsp.msg.clone()),
			_ => None,
		};
		trace!("sendTo {} frame", frame.kind());
		codec.write_frame(&mut w, frame).await?;
		if let Some(msg) = rejected {
			if let Err(e) = w.shutdown().await {
				debug!("cannot shutdown tunnel after login rejection ({})", e);
			}
			return Err(Error::LoginRejected(msg));
		}
	}
	Ok(())
}

/// Reads the local socket into DATA frames carrying CRC and index.
///
/// On EOF the queue is closed so that whatever was read can still be
/// relayed. Half-close is not supported: EOF from the local peer ends the
/// whole sub-connection, so a reply sent after it is lost.
///
/// # Errors
///
/// Returns an error if reading fails.
pub async fn recv_from_sonny(
	mut r: BoxRead,
	recv: QueueSender<Frame>,
	chunk_size: usize,
) -> Result<(), Error> {
	let mut buf = vec![0_u8; chunk_size];
	let mut index = 0;
	loop {
		let n = r.read(&mut buf).await?;
		if n == 0 {
			trace!("recvFromSonny EOF");
			recv.close();
			return Ok(());
		}
		index = next_index(index);
		let data = buf[..n].to_vec();
		let frame = DataFrame {
			id: Tag::default(),
			crc: crc::crc32::checksum_ieee(&data),
			data,
			compressed: false,
			index,
		};
		if !recv.write(Frame::Data(frame)).await {
			return Ok(());
		}
		trace!("recvFromSonny {} bytes", n);
	}
}

/// Verifies DATA frames from `send` and writes them to the local socket.
///
/// # Errors
///
/// Returns an error if a frame is broken, the peer closed the
/// sub-connection or writing fails.
pub async fn send_to_sonny(mut w: BoxWrite, mut send: QueueReceiver<Frame>) -> Result<(), Error> {
	let mut expected = 0;
	while let Some(frame) = send.read().await {
		match frame {
			Frame::Data(f) => {
				check_data(&f, next_index(expected))?;
				expected = f.index;
				w.write_all(&f.data).await?;
				trace!("sendToSonny {} bytes", f.data.len());
			}
			Frame::Close(_) => {
				if let Err(e) = w.shutdown().await {
					debug!("cannot shutdown local socket ({})", e);
				}
				return Err(Error::ClosedByRemote);
			}
			other => return Err(Error::UnexpectedFrame(other.kind())),
		}
	}
	Ok(())
}

fn check_data(f: &DataFrame, expected_index: u32) -> Result<(), Error> {
	if f.compressed {
		return Err(Error::StillCompressed);
	}
	let crc = crc::crc32::checksum_ieee(&f.data);
	if crc != f.crc {
		return Err(Error::CrcMismatch {
			expected: f.crc,
			actual: crc,
		});
	}
	if f.index != expected_index {
		return Err(Error::IndexMismatch {
			expected: expected_index,
			actual: f.index,
		});
	}
	Ok(())
}

/// Tags DATA frames read from the local socket and forwards them to the
/// tunnel, once the sub-connection is established.
///
/// # Errors
///
/// Returns [`Error::ClosedByLocal`] once the local socket is drained.
pub async fn copy_sonny_recv(
	mut recv: QueueReceiver<Frame>,
	conn: Arc<ProxyConn>,
	father: Arc<ProxyConn>,
) -> Result<(), Error> {
	conn.established.wait().await;
	while let Some(frame) = recv.read().await {
		match frame {
			Frame::Data(mut f) => {
				f.id = conn.id.clone();
				conn.actived.inc();
				let len = f.data.len();
				if !father.send(Frame::Data(f)).await {
					return Ok(());
				}
				trace!("copySonnyRecv {} {} bytes", conn.id, len);
			}
			other => return Err(Error::UnexpectedFrame(other.kind())),
		}
	}
	Err(Error::ClosedByLocal)
}

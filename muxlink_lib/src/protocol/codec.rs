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


//! Binary encoding of [`Frame`]s.
//!
//! On the wire every message is a little endian `u32` length followed by
//! that many bytes of encoded frame:
//! ```not_rust
//! +------+----------------------+
//! | type | fields of the type   |
//! +------+----------------------+
//! | u8   | various              |
//! +------+----------------------+
//! ```
//! Integers are little endian, strings are `u16 len | utf8`,
//! payloads are `u32 len | bytes`.
//!
//! Only [`DataFrame`] payloads are compressed and encrypted, in that order.

use super::frame::{
	ClientType, CloseFrame, DataFrame, Frame, FrameType, LoginFrame, LoginRspFrame, OpenFrame,
	OpenRspFrame, PingFrame, PongFrame, ProxyProto,
};
use crate::{
	config::Config,
	prelude::*,
	utils::{compress, crypto::FrameCipher},
};
use std::io;

const LEN_SIZE: usize = std::mem::size_of::<u32>();

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("Type error ({0})")]
	UnknownType(u8),
	#[error("{0}Frame nil")]
	MissingPayload(FrameType),
	#[error("message of {len} bytes is larger than {max}")]
	MessageTooLarge { len: usize, max: usize },
	#[error("frame truncated")]
	Truncated,
	#[error("{0} trailing bytes after frame")]
	TrailingBytes(usize),
	#[error("field of {0} bytes is too long")]
	FieldTooLong(usize),
	#[error("invalid {0} value {1}")]
	InvalidField(&'static str, u8),
	#[error("string is not utf8")]
	InvalidString,
	#[error("compress error ({0})")]
	Compress(io::Error),
	#[error("IO error ({0})")]
	Io(#[from] io::Error),
}

/// Frame encoder/decoder of one tunnel.
#[derive(Debug, Clone)]
pub struct Codec {
	compress: usize,
	cipher: Option<FrameCipher>,
	max_msg_size: usize,
}

impl Codec {
	/// `compress` is the payload size above which DATA is compressed,
	/// 0 disables compression. An empty `encrypt` disables encryption.
	#[must_use]
	pub fn new(compress: usize, encrypt: &str, max_msg_size: usize) -> Self {
		Self {
			compress,
			cipher: FrameCipher::new(encrypt),
			max_msg_size,
		}
	}

	#[must_use]
	pub fn from_config(conf: &Config) -> Self {
		Self::new(conf.compress, &conf.encrypt, conf.max_msg_size)
	}

	#[inline]
	#[must_use]
	pub fn max_msg_size(&self) -> usize {
		self.max_msg_size
	}

	/// Serializes `frame`, compressing and encrypting DATA payloads.
	///
	/// # Errors
	///
	/// Returns an error if a field does not fit its length prefix or
	/// compression fails.
	pub fn encode(&self, frame: Frame) -> Result<Vec<u8>, Error> {
		let frame = match frame {
			Frame::Data(f) => Frame::Data(self.seal(f)?),
			other => other,
		};
		let mut buf = Vec::with_capacity(64);
		buf.put_u8(frame.kind().into());
		match &frame {
			Frame::Login(f) => {
				buf.put_u8(f.proxy_proto.into());
				buf.put_u8(f.client_type.into());
				put_str(&mut buf, &f.from_addr)?;
				put_str(&mut buf, &f.to_addr)?;
				put_str(&mut buf, &f.name)?;
				put_str(&mut buf, &f.key)?;
			}
			Frame::LoginRsp(f) => {
				buf.put_u8(f.ret.into());
				put_str(&mut buf, &f.msg)?;
			}
			Frame::Data(f) => {
				put_str(&mut buf, &f.id)?;
				buf.put_u8(f.compressed.into());
				buf.put_u32_le(f.crc);
				buf.put_u32_le(f.index);
				put_bytes(&mut buf, &f.data)?;
			}
			Frame::Ping(PingFrame { time }) | Frame::Pong(PongFrame { time }) => {
				buf.put_i64_le(*time);
			}
			Frame::Open(f) => {
				put_str(&mut buf, &f.id)?;
				put_str(&mut buf, &f.to_addr)?;
			}
			Frame::OpenRsp(f) => {
				put_str(&mut buf, &f.id)?;
				buf.put_u8(f.ret.into());
				put_str(&mut buf, &f.msg)?;
			}
			Frame::Close(f) => {
				put_str(&mut buf, &f.id)?;
			}
		}
		Ok(buf)
	}

	/// Parses one encoded frame, decrypting and decompressing DATA payloads.
	///
	/// # Errors
	///
	/// Returns an error if the type is unknown, its payload is missing or
	/// malformed.
	pub fn decode(&self, mut buf: &[u8]) -> Result<Frame, Error> {
		let type_num = get_u8(&mut buf)?;
		let kind = FrameType::try_from(type_num).map_err(|_| Error::UnknownType(type_num))?;
		if buf.is_empty() {
			return Err(Error::MissingPayload(kind));
		}
		let frame = match kind {
			FrameType::Login => {
				let proxy_proto = get_u8(&mut buf)?;
				let proxy_proto = ProxyProto::try_from(proxy_proto)
					.map_err(|_| Error::InvalidField("proxy proto", proxy_proto))?;
				let client_type = get_u8(&mut buf)?;
				let client_type = ClientType::try_from(client_type)
					.map_err(|_| Error::InvalidField("client type", client_type))?;
				Frame::Login(LoginFrame {
					proxy_proto,
					client_type,
					from_addr: get_str(&mut buf)?,
					to_addr: get_str(&mut buf)?,
					name: get_str(&mut buf)?,
					key: get_str(&mut buf)?,
				})
			}
			FrameType::LoginRsp => Frame::LoginRsp(LoginRspFrame {
				ret: get_bool(&mut buf)?,
				msg: get_str(&mut buf)?,
			}),
			FrameType::Data => {
				let f = DataFrame {
					id: get_str(&mut buf)?.into(),
					compressed: get_bool(&mut buf)?,
					crc: get_u32(&mut buf)?,
					index: get_u32(&mut buf)?,
					data: get_bytes(&mut buf)?,
				};
				Frame::Data(self.open(f)?)
			}
			FrameType::Ping => Frame::Ping(PingFrame {
				time: get_i64(&mut buf)?,
			}),
			FrameType::Pong => Frame::Pong(PongFrame {
				time: get_i64(&mut buf)?,
			}),
			FrameType::Open => Frame::Open(OpenFrame {
				id: get_str(&mut buf)?.into(),
				to_addr: get_str(&mut buf)?,
			}),
			FrameType::OpenRsp => Frame::OpenRsp(OpenRspFrame {
				id: get_str(&mut buf)?.into(),
				ret: get_bool(&mut buf)?,
				msg: get_str(&mut buf)?,
			}),
			FrameType::Close => Frame::Close(CloseFrame {
				id: get_str(&mut buf)?.into(),
			}),
		};
		if !buf.is_empty() {
			return Err(Error::TrailingBytes(buf.len()));
		}
		Ok(frame)
	}

	/// Encodes `frame` and writes it with its length prefix.
	///
	/// # Errors
	///
	/// Returns an error if encoding fails, the message exceeds the maximum
	/// size or writing fails.
	pub async fn write_frame<W>(&self, w: &mut W, frame: Frame) -> Result<(), Error>
	where
		W: AsyncWrite + Unpin,
	{
		let body = self.encode(frame)?;
		if body.len() > self.max_msg_size {
			return Err(Error::MessageTooLarge {
				len: body.len(),
				max: self.max_msg_size,
			});
		}
		let len = u32::try_from(body.len()).map_err(|_| Error::FieldTooLong(body.len()))?;
		let mut msg = Vec::with_capacity(LEN_SIZE + body.len());
		msg.put_u32_le(len);
		msg.extend_from_slice(&body);
		w.write_all(&msg).await?;
		w.flush().await?;
		Ok(())
	}

	/// Reads one length prefixed message and decodes it.
	///
	/// # Errors
	///
	/// Returns an error if reading fails, the announced length exceeds the
	/// maximum size or decoding fails.
	pub async fn read_frame<R>(&self, r: &mut R) -> Result<Frame, Error>
	where
		R: AsyncRead + Unpin,
	{
		let len = r.read_u32_le().await? as usize;
		if len > self.max_msg_size {
			return Err(Error::MessageTooLarge {
				len,
				max: self.max_msg_size,
			});
		}
		let mut body = vec![0_u8; len];
		r.read_exact(&mut body).await?;
		self.decode(&body)
	}

	fn seal(&self, mut f: DataFrame) -> Result<DataFrame, Error> {
		if !f.compressed && self.compress > 0 && f.data.len() > self.compress {
			let packed = compress::compress(&f.data).map_err(Error::Compress)?;
			if packed.len() < f.data.len() {
				f.data = packed;
				f.compressed = true;
			}
		}
		if let Some(cipher) = &self.cipher {
			cipher.encrypt(&mut f.data);
		}
		Ok(f)
	}

	fn open(&self, mut f: DataFrame) -> Result<DataFrame, Error> {
		if let Some(cipher) = &self.cipher {
			cipher.decrypt(&mut f.data);
		}
		if f.compressed {
			f.data = compress::decompress(&f.data, self.max_msg_size).map_err(Error::Compress)?;
			f.compressed = false;
		}
		Ok(f)
	}
}

fn put_str(buf: &mut Vec<u8>, s: &str) -> Result<(), Error> {
	let len = u16::try_from(s.len()).map_err(|_| Error::FieldTooLong(s.len()))?;
	buf.put_u16_le(len);
	buf.put_slice(s.as_bytes());
	Ok(())
}

fn put_bytes(buf: &mut Vec<u8>, data: &[u8]) -> Result<(), Error> {
	let len = u32::try_from(data.len()).map_err(|_| Error::FieldTooLong(data.len()))?;
	buf.put_u32_le(len);
	buf.put_slice(data);
	Ok(())
}

fn ensure(buf: &[u8], n: usize) -> Result<(), Error> {
	if buf.remaining() < n {
		Err(Error::Truncated)
	} else {
		Ok(())
	}
}

fn get_u8(buf: &mut &[u8]) -> Result<u8, Error> {
	ensure(buf, 1)?;
	Ok(buf.get_u8())
}

fn get_bool(buf: &mut &[u8]) -> Result<bool, Error> {
	get_u8(buf).map(|v| v != 0)
}

fn get_u32(buf: &mut &[u8]) -> Result<u32, Error> {
	ensure(buf, 4)?;
	Ok(buf.get_u32_le())
}

fn get_i64(buf: &mut &[u8]) -> Result<i64, Error> {
	ensure(buf, 8)?;
	Ok(buf.get_i64_le())
}

fn get_str(buf: &mut &[u8]) -> Result<String, Error> {
	ensure(buf, 2)?;
	let len = buf.get_u16_le() as usize;
	ensure(buf, len)?;
	let s = std::str::from_utf8(&buf[..len]).map_err(|_| Error::InvalidString)?;
	let s = s.to_owned();
	buf.advance(len);
	Ok(s)
}

fn get_bytes(buf: &mut &[u8]) -> Result<Vec<u8>, Error> {
	let len = get_u32(buf)? as usize;
	ensure(buf, len)?;
	let data = buf[..len].to_vec();
	buf.advance(len);
	Ok(data)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn data_frame(data: Vec<u8>) -> DataFrame {
		DataFrame {
			id: "conn-1".into(),
			crc: crc::crc32::checksum_ieee(&data),
			data,
			compressed: false,
			index: 7,
		}
	}

	#[test]
	fn test_data_round_trip() {
		let payloads = [
			vec![],
			b"short".to_vec(),
			vec![b'a'; 8192],
			(0..=255_u8).cycle().take(3000).collect::<Vec<_>>(),
		];
		let codecs = [
			Codec::new(0, "", 1 << 20),
			Codec::new(16, "", 1 << 20),
			Codec::new(0, "secret", 1 << 20),
			Codec::new(16, "secret", 1 << 20),
		];
		for codec in &codecs {
			for data in &payloads {
				let f = Frame::Data(data_frame(data.clone()));
				let buf = codec.encode(f.clone()).unwrap();
				assert_eq!(codec.decode(&buf).unwrap(), f);
			}
		}
	}

	#[test]
	fn test_compress_only_when_smaller() {
		let codec = Codec::new(16, "", 1 << 20);
		let compressible = codec.seal(data_frame(vec![0_u8; 4096])).unwrap();
		assert!(compressible.compressed);
		assert!(compressible.data.len() < 4096);

		let random: Vec<u8> = {
			let mut rng = rand::thread_rng();
			(0..512).map(|_| rng.gen()).collect()
		};
		let incompressible = codec.seal(data_frame(random.clone())).unwrap();
		assert!(!incompressible.compressed);
		assert_eq!(incompressible.data, random);

		let below_threshold = codec.seal(data_frame(vec![0_u8; 16])).unwrap();
		assert!(!below_threshold.compressed);
	}

	#[test]
	fn test_encrypted_payload_differs() {
		let codec = Codec::new(0, "secret", 1 << 20);
		let plain = codec.seal(data_frame(b"plain text".to_vec())).unwrap();
		assert_ne!(plain.data, b"plain text");
	}

	#[test]
	fn test_control_frames_round_trip() {
		let codec = Codec::new(0, "secret", 1 << 20);
		let frames = [
			Frame::Login(LoginFrame {
				proxy_proto: ProxyProto::Tcp,
				client_type: ClientType::ReverseSocks5,
				from_addr: "127.0.0.1:9001".into(),
				to_addr: "127.0.0.1:9000".into(),
				name: "office".into(),
				key: "123456".into(),
			}),
			Frame::login_rsp(false, "key error"),
			Frame::Ping(PingFrame { time: -5 }),
			Frame::Pong(PongFrame { time: 1_234_567 }),
			Frame::Open(OpenFrame {
				id: "x-1".into(),
				to_addr: "example.com:80".into(),
			}),
			Frame::open_rsp("x-1".into(), true, "ok"),
			Frame::Close(CloseFrame { id: "x-1".into() }),
		];
		for f in &frames {
			let buf = codec.encode(f.clone()).unwrap();
			assert_eq!(&codec.decode(&buf).unwrap(), f);
		}
	}

	#[test]
	fn test_missing_payload() {
		let codec = Codec::new(0, "", 1024);
		let err = codec.decode(&[u8::from(FrameType::Open)]).unwrap_err();
		assert!(matches!(err, Error::MissingPayload(FrameType::Open)));
		assert_eq!(err.to_string(), "OpenFrame nil");
	}

	#[test]
	fn test_unknown_type() {
		let codec = Codec::new(0, "", 1024);
		assert!(matches!(
			codec.decode(&[200, 1, 2]).unwrap_err(),
			Error::UnknownType(200)
		));
		assert!(matches!(codec.decode(&[]).unwrap_err(), Error::Truncated));
	}

	#[test]
	fn test_truncated_and_trailing() {
		let codec = Codec::new(0, "", 1024);
		let buf = codec
			.encode(Frame::Close(CloseFrame { id: "abc".into() }))
			.unwrap();
		assert!(matches!(
			codec.decode(&buf[..buf.len() - 1]).unwrap_err(),
			Error::Truncated
		));
		let mut longer = buf.clone();
		longer.push(0);
		assert!(matches!(
			codec.decode(&longer).unwrap_err(),
			Error::TrailingBytes(1)
		));
	}

	#[test]
	fn test_read_write_frame() {
		tokio::runtime::Runtime::new().unwrap().block_on(async {
			let codec = Codec::new(8, "k", 1024);
			let (mut a, mut b) = tokio::io::duplex(4096);
			let f = Frame::Data(data_frame(vec![1_u8; 100]));
			codec.write_frame(&mut a, f.clone()).await.unwrap();
			codec.write_frame(&mut a, Frame::Ping(PingFrame { time: 1 })).await.unwrap();
			assert_eq!(codec.read_frame(&mut b).await.unwrap(), f);
			assert_eq!(
				codec.read_frame(&mut b).await.unwrap(),
				Frame::Ping(PingFrame { time: 1 })
			);
		});
	}

	#[test]
	fn test_oversized() {
		tokio::runtime::Runtime::new().unwrap().block_on(async {
			let codec = Codec::new(0, "", 64);
			let (mut a, mut b) = tokio::io::duplex(4096);
			let err = codec
				.write_frame(&mut a, Frame::Data(data_frame(vec![1_u8; 100])))
				.await
				.unwrap_err();
			assert!(matches!(err, Error::MessageTooLarge { max: 64, .. }));

			a.write_all(&1000_u32.to_le_bytes()).await.unwrap();
			let err = codec.read_frame(&mut b).await.unwrap_err();
			assert!(matches!(err, Error::MessageTooLarge { len: 1000, max: 64 }));
		});
	}
}

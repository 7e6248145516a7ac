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


use crate::{
	prelude::BoxStdErr,
	protocol::{codec, FrameType},
	service::socks5,
};
use std::io;
use thiserror::Error as ThisError;

/// Reason a tunnel task ended.
#[derive(Debug, ThisError)]
pub enum Error {
	#[error("IO error ({0})")]
	Io(#[from] io::Error),
	#[error("frame error ({0})")]
	Codec(#[from] codec::Error),
	#[error("socks5 error ({0})")]
	Socks(#[from] socks5::Error),
	#[error("stop")]
	Stop,
	#[error("established timeout")]
	EstablishedTimeout,
	#[error("ping pong timeout")]
	PingTimeout,
	#[error("conn timeout")]
	Inactive,
	#[error("needclose")]
	NeedClose,
	#[error("login rejected ({0})")]
	LoginRejected(String),
	#[error("closed by remote")]
	ClosedByRemote,
	#[error("closed by local")]
	ClosedByLocal,
	#[error("crc mismatch (expected {expected:#010x}, got {actual:#010x})")]
	CrcMismatch { expected: u32, actual: u32 },
	#[error("index mismatch (expected {expected}, got {actual})")]
	IndexMismatch { expected: u32, actual: u32 },
	#[error("data frame is still compressed")]
	StillCompressed,
	#[error("unexpected {0} frame")]
	UnexpectedFrame(FrameType),
	#[error("{0}")]
	Other(BoxStdErr),
}

impl Error {
	/// Returns `true` for the expected ways a tunnel or sub-connection ends.
	#[must_use]
	pub fn is_liveness(&self) -> bool {
		matches!(
			self,
			Error::Stop
				| Error::EstablishedTimeout
				| Error::PingTimeout
				| Error::Inactive
				| Error::NeedClose
				| Error::ClosedByRemote
				| Error::ClosedByLocal
		)
	}
}

impl From<BoxStdErr> for Error {
	fn from(e: BoxStdErr) -> Self {
		Error::Other(e)
	}
}

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


use tokio::io::{AsyncRead, AsyncWrite};

pub type BoxRead = Box<dyn AsyncRead + Send + Sync + Unpin>;
pub type BoxWrite = Box<dyn AsyncWrite + Send + Sync + Unpin>;

/// A byte stream that can be split into independently owned halves.
pub trait AsyncReadWrite: 'static + AsyncRead + AsyncWrite + Send + Sync + Unpin {
	fn split(self: Box<Self>) -> (BoxRead, BoxWrite);
}

impl AsyncReadWrite for tokio::net::TcpStream {
	fn split(self: Box<Self>) -> (BoxRead, BoxWrite) {
		let (r, w) = self.into_split();
		(Box::new(r), Box::new(w))
	}
}

/// In-memory pipe, mostly for tests.
impl AsyncReadWrite for tokio::io::DuplexStream {
	fn split(self: Box<Self>) -> (BoxRead, BoxWrite) {
		let (r, w) = tokio::io::split(*self);
		(Box::new(r), Box::new(w))
	}
}

impl From<tokio::net::TcpStream> for Box<dyn AsyncReadWrite> {
	fn from(stream: tokio::net::TcpStream) -> Self {
		Box::new(stream)
	}
}

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


pub mod codec;
pub mod frame;
pub mod socks_addr;

pub use codec::Codec;
pub use frame::{
	ClientType, CloseFrame, DataFrame, Frame, FrameType, LoginFrame, LoginRspFrame, OpenFrame,
	OpenRspFrame, PingFrame, PongFrame, ProxyProto,
};
pub use socks_addr::{SocksAddr, SocksDestination};

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


#![deny(clippy::all)]
#![warn(clippy::pedantic)]

// All codes below forbid unsafe.

#[forbid(unsafe_code)]
pub mod client;
#[forbid(unsafe_code)]
pub mod config;
#[forbid(unsafe_code)]
mod error;
#[forbid(unsafe_code)]
mod prelude;
#[forbid(unsafe_code)]
pub mod protocol;
#[forbid(unsafe_code)]
pub mod server;
#[forbid(unsafe_code)]
pub mod service;
#[forbid(unsafe_code)]
pub mod session;
#[forbid(unsafe_code)]
pub mod transport;
#[forbid(unsafe_code)]
pub mod utils;

pub use client::{Client, ClientSettings};
pub use config::{BuildError, Builder, Config};
pub use error::Error;
pub use server::Server;

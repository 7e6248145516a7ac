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
#![allow(clippy::default_trait_access)]

mod args;
mod config;
#[cfg(feature = "parse-config")]
mod parse_config_impl;

use args::{Action, AppOptions, ServeAction};
use config::{Config, Mode};
use log::{error, info};
use muxlink_lib::{Client, Server};
use std::{borrow::Cow, io, sync::Arc};
use tokio::runtime::Runtime;

type BoxStdErr = Box<dyn std::error::Error + Send + Sync>;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("[IO error] {0}")]
	Io(#[from] io::Error),
	#[error("[input] {0}")]
	Input(Cow<'static, str>),
	#[error("[config] {0}")]
	Config(BoxStdErr),
	#[error("[runtime] {0}")]
	Runtime(BoxStdErr),
}

fn make_config(action: ServeAction) -> Result<(Config, Mode), Error> {
	let mut conf = match action {
		#[cfg(feature = "parse-config")]
		ServeAction::File { coms, path, format } => {
			let conf_str = std::fs::read_to_string(&path).map_err(|e| {
				Error::Input(format!("cannot read config '{}' ({})", path.display(), e).into())
			})?;
			parse_config_impl::make_config(format, &conf_str, coms)?
		}
		ServeAction::Args { coms, mode } => {
			let mut conf = Config::default();
			match mode {
				Mode::Server(s) => conf.server = Some(s),
				Mode::Client(c) => conf.client = Some(c),
			}
			coms.apply(&mut conf);
			conf
		}
	};
	let mode = conf.take_mode().map_err(Error::Input)?;
	Ok((conf, mode))
}

fn serve(action: ServeAction) -> Result<(), Error> {
	let (conf, mode) = make_config(action)?;
	conf.log.init_logger().map_err(Error::Config)?;
	let tunnel = Arc::new(
		conf.tunnel
			.build()
			.map_err(|e| Error::Config(Box::new(e)))?,
	);

	let rt = Runtime::new()?;
	rt.block_on(async move {
		match mode {
			Mode::Server(s) => {
				let server = Server::bind(tunnel, &s.listen)
					.await
					.map_err(|e| Error::Runtime(Box::new(e)))?;
				wait_for_ctrl_c().await?;
				server.close().await;
			}
			Mode::Client(c) => {
				info!("Client '{}' connecting to {}", c.name, c.server);
				let client = Client::start(tunnel, c);
				wait_for_ctrl_c().await?;
				client.close().await;
			}
		}
		Ok(())
	})
}

async fn wait_for_ctrl_c() -> Result<(), Error> {
	tokio::signal::ctrl_c().await?;
	info!("Ctrl-C received, shutting down");
	Ok(())
}

fn main() {
	let action = match AppOptions::new_from_args().into_action() {
		Ok(action) => action,
		Err(err) => {
			println!("Invalid arguments: {}", err);
			std::process::exit(exitcode::USAGE);
		}
	};
	let action = match action {
		Action::CheckVersion => {
			println!("{}", VERSION);
			return;
		}
		Action::Serve(action) => action,
	};
	if let Err(err) = serve(action) {
		error!("{}", err);
		println!("Error happened during initialization:\n {}\n", err);
		std::process::exit(match err {
			Error::Io(_) => exitcode::IOERR,
			Error::Input(_) | Error::Config(_) => exitcode::CONFIG,
			Error::Runtime(_) => exitcode::SOFTWARE,
		});
	}
}

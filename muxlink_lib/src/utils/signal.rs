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


use std::sync::Arc;
use tokio::sync::watch;

/// A one-way boolean latch.
///
/// Once set it stays set. Any number of tasks can wait for it.
#[derive(Clone, Debug)]
pub struct Signal {
	tx: Arc<watch::Sender<bool>>,
}

impl Signal {
	#[must_use]
	pub fn new() -> Self {
		let (tx, _rx) = watch::channel(false);
		Self { tx: Arc::new(tx) }
	}

	/// Sets the latch.
	///
	/// Returns `true` only for the call that actually flipped it.
	pub fn set(&self) -> bool {
		let mut flipped = false;
		self.tx.send_if_modified(|v| {
			if *v {
				false
			} else {
				*v = true;
				flipped = true;
				true
			}
		});
		flipped
	}

	#[inline]
	#[must_use]
	pub fn is_set(&self) -> bool {
		*self.tx.borrow()
	}

	/// Resolves once the latch is set, immediately if it already is.
	pub async fn wait(&self) {
		let mut rx = self.tx.subscribe();
		loop {
			if *rx.borrow_and_update() {
				return;
			}
			if rx.changed().await.is_err() {
				return;
			}
		}
	}
}

impl Default for Signal {
	fn default() -> Self {
		Self::new()
	}
}

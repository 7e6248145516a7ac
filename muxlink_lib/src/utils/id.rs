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


use crate::prelude::*;
use std::sync::atomic::{AtomicU64, Ordering};

/// Produces sub-connection ids.
///
/// Ids must be unique among the live sub-connections of one tunnel peer.
pub trait IdSource: Send + Sync {
	fn next_id(&self) -> Tag;
}

/// Default [`IdSource`]: a random per-instance prefix plus a counter.
#[derive(Debug)]
pub struct SequentialIds {
	prefix: u64,
	next: AtomicU64,
}

impl SequentialIds {
	#[must_use]
	pub fn new() -> Self {
		Self {
			prefix: rand::thread_rng().next_u64(),
			next: AtomicU64::new(1),
		}
	}
}

impl Default for SequentialIds {
	fn default() -> Self {
		Self::new()
	}
}

impl IdSource for SequentialIds {
	fn next_id(&self) -> Tag {
		let n = self.next.fetch_add(1, Ordering::Relaxed);
		Tag::from(format!("{:016x}-{}", self.prefix, n))
	}
}

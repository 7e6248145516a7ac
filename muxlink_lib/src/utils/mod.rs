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


mod atomic_values;
pub use atomic_values::{Counter, Switch};

mod signal;
pub use signal::Signal;

pub mod queue;
pub use queue::{QueueReceiver, QueueSender};

mod group;
pub use group::Group;

pub mod compress;
pub mod crypto;
pub mod id;

use std::convert::TryFrom;
pub use std::time::{SystemTime, UNIX_EPOCH};

/// Nanoseconds since the unix epoch, negative for times before it.
#[must_use]
pub fn timestamp_nanos(time: SystemTime) -> i64 {
	let (neg, dur) = match time.duration_since(UNIX_EPOCH) {
		Ok(dur) => (false, dur),
		Err(e) => (true, e.duration()),
	};
	let nanos = i64::try_from(dur.as_nanos()).unwrap_or(i64::MAX);
	if neg {
		-nanos
	} else {
		nanos
	}
}

#[inline]
#[must_use]
pub fn timestamp_nanos_now() -> i64 {
	timestamp_nanos(SystemTime::now())
}

#[cfg(test)]
mod tests {
	use super::{timestamp_nanos, UNIX_EPOCH};
	use std::time::Duration;

	#[test]
	fn test_timestamp_nanos() {
		assert_eq!(timestamp_nanos(UNIX_EPOCH), 0);
		assert_eq!(
			timestamp_nanos(UNIX_EPOCH + Duration::from_millis(3)),
			3_000_000
		);
		assert_eq!(timestamp_nanos(UNIX_EPOCH - Duration::from_secs(1)), -1_000_000_000);
	}
}

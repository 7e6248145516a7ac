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


//! Closable, bounded, backpressured message queue.
//!
//! Writers block while the buffer is full. Closing is idempotent and
//! wakes every blocked writer, which then reports failure instead of
//! enqueuing. Readers drain whatever is still buffered before they
//! observe the close.

use super::Signal;
use std::time::Duration;
use tokio::sync::mpsc;

/// Creates a queue that buffers at most `capacity` items.
///
/// # Panics
///
/// Panics if `capacity` is zero.
#[must_use]
pub fn channel<T>(capacity: usize) -> (QueueSender<T>, QueueReceiver<T>) {
	let (tx, rx) = mpsc::channel(capacity);
	let closed = Signal::new();
	(
		QueueSender {
			tx,
			closed: closed.clone(),
		},
		QueueReceiver { rx, closed },
	)
}

pub struct QueueSender<T> {
	tx: mpsc::Sender<T>,
	closed: Signal,
}

impl<T> Clone for QueueSender<T> {
	fn clone(&self) -> Self {
		Self {
			tx: self.tx.clone(),
			closed: self.closed.clone(),
		}
	}
}

impl<T> QueueSender<T> {
	/// Enqueues `v`, waiting for space if the queue is full.
	///
	/// Returns `false` if the queue is (or becomes) closed before `v`
	/// could be enqueued.
	pub async fn write(&self, v: T) -> bool {
		if self.closed.is_set() {
			return false;
		}
		tokio::select! {
			biased;
			() = self.closed.wait() => false,
			res = self.tx.send(v) => res.is_ok(),
		}
	}

	/// Same as [`Self::write`], but gives up after `dur`.
	pub async fn write_timeout(&self, v: T, dur: Duration) -> bool {
		tokio::time::timeout(dur, self.write(v))
			.await
			.unwrap_or(false)
	}

	/// Enqueues `v` only if there is space right now.
	pub fn try_write(&self, v: T) -> bool {
		if self.closed.is_set() {
			return false;
		}
		self.tx.try_send(v).is_ok()
	}

	#[inline]
	pub fn close(&self) {
		self.closed.set();
	}

	#[inline]
	#[must_use]
	pub fn is_closed(&self) -> bool {
		self.closed.is_set()
	}
}

pub struct QueueReceiver<T> {
	rx: mpsc::Receiver<T>,
	closed: Signal,
}

impl<T> QueueReceiver<T> {
	/// Dequeues the next item.
	///
	/// Returns `None` once the queue is closed and drained.
	pub async fn read(&mut self) -> Option<T> {
		if self.closed.is_set() {
			return self.rx.try_recv().ok();
		}
		tokio::select! {
			biased;
			v = self.rx.recv() => v,
			() = self.closed.wait() => self.rx.try_recv().ok(),
		}
	}

	#[inline]
	pub fn close(&self) {
		self.closed.set();
	}

	#[inline]
	#[must_use]
	pub fn is_closed(&self) -> bool {
		self.closed.is_set()
	}
}

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


//! Structured concurrency for tunnel tasks.
//!
//! A [`Group`] owns a set of spawned tasks and may have a father and
//! sons. The first task that fails makes the whole group exit, which
//! cancels every task of the group and of all its descendants. Each
//! running task is also counted in every ancestor, so waiting on a
//! father waits for the whole subtree.

use super::Signal;
use crate::{prelude::*, Error};
use parking_lot::Mutex;
use std::{
	collections::HashMap,
	future::Future,
	sync::{
		atomic::{AtomicUsize, Ordering},
		Weak,
	},
	time::Duration,
};
use tokio::sync::Notify;

const SLOW_WAIT_LOG_INTERVAL: Duration = Duration::from_secs(1);

type ExitFn = Box<dyn FnOnce() + Send>;

#[derive(Clone)]
pub struct Group {
	inner: Arc<Inner>,
}

struct Inner {
	father: Option<Arc<Inner>>,
	sons: Mutex<Vec<Weak<Inner>>>,
	running: AtomicUsize,
	idle: Notify,
	exited: Signal,
	err: Mutex<Option<Arc<Error>>>,
	on_exit: Mutex<Option<ExitFn>>,
	task_names: Mutex<HashMap<Tag, usize>>,
}

impl Group {
	/// Creates a root group.
	#[must_use]
	pub fn new() -> Self {
		Self::with_father(None, || {})
	}

	/// Creates a group.
	///
	/// `on_exit` runs exactly once, when the group exits.
	/// If `father` has already exited, the new group exits immediately
	/// with the father's error.
	pub fn with_father(father: Option<&Group>, on_exit: impl FnOnce() + Send + 'static) -> Self {
		let inner = Arc::new(Inner {
			father: father.map(|f| f.inner.clone()),
			sons: Mutex::new(Vec::new()),
			running: AtomicUsize::new(0),
			idle: Notify::new(),
			exited: Signal::new(),
			err: Mutex::new(None),
			on_exit: Mutex::new(Some(Box::new(on_exit))),
			task_names: Mutex::new(HashMap::new()),
		});
		if let Some(father) = father {
			let father_exited = {
				let mut sons = father.inner.sons.lock();
				if father.inner.exited.is_set() {
					true
				} else {
					sons.retain(|s| s.strong_count() > 0);
					sons.push(Arc::downgrade(&inner));
					false
				}
			};
			if father_exited {
				let err = father
					.inner
					.err
					.lock()
					.clone()
					.unwrap_or_else(|| Arc::new(Error::Stop));
				inner.exit(err);
			}
		}
		Self { inner }
	}

	/// Creates a son of this group.
	#[must_use]
	pub fn son(&self, on_exit: impl FnOnce() + Send + 'static) -> Self {
		Self::with_father(Some(self), on_exit)
	}

	/// Spawns `task` into this group.
	///
	/// The task is cancelled when the group exits. If it returns an
	/// error, the group exits with that error.
	pub fn go<F>(&self, name: impl Into<Tag>, task: F)
	where
		F: Future<Output = Result<(), Error>> + Send + 'static,
	{
		let name = name.into();
		let guard = TaskGuard::new(self.inner.clone(), name);
		tokio::spawn(async move {
			let exited = guard.inner.exited.clone();
			let res = tokio::select! {
				biased;
				() = exited.wait() => Ok(()),
				res = task => res,
			};
			if let Err(e) = res {
				debug!("group task '{}' failed ({})", guard.name, e);
				guard.inner.exit(Arc::new(e));
			}
			drop(guard);
		});
	}

	/// Makes the group exit with [`Error::Stop`].
	pub fn stop(&self) {
		self.inner.exit(Arc::new(Error::Stop));
	}

	/// Makes the group exit with `err`.
	///
	/// Does nothing if the group has already exited.
	pub fn exit(&self, err: Error) {
		self.inner.exit(Arc::new(err));
	}

	/// Resolves once the group has exited.
	pub async fn done(&self) {
		self.inner.exited.wait().await;
	}

	#[must_use]
	pub fn is_exited(&self) -> bool {
		self.inner.exited.is_set()
	}

	/// Number of tasks still running in this group and its descendants.
	#[must_use]
	pub fn running(&self) -> usize {
		self.inner.running.load(Ordering::SeqCst)
	}

	/// Error the group exited with, if any.
	#[must_use]
	pub fn error(&self) -> Option<Arc<Error>> {
		self.inner.err.lock().clone()
	}

	/// Waits until every task of this group and its descendants has
	/// finished.
	///
	/// # Errors
	///
	/// Returns the error the group exited with.
	pub async fn wait(&self) -> Result<(), Arc<Error>> {
		let mut slow_rounds = 0_u32;
		loop {
			let notified = self.inner.idle.notified();
			futures::pin_mut!(notified);
			notified.as_mut().enable();
			if self.inner.running.load(Ordering::SeqCst) == 0 {
				break;
			}
			if self.inner.exited.is_set() {
				if tokio::time::timeout(SLOW_WAIT_LOG_INTERVAL, notified)
					.await
					.is_err()
				{
					slow_rounds += 1;
					warn!(
						"group still waiting after {}s, running: {}",
						slow_rounds,
						self.running_names()
					);
				}
			} else {
				tokio::select! {
					() = notified => {},
					() = self.inner.exited.wait() => {},
				}
			}
		}
		match self.inner.err.lock().clone() {
			Some(e) => Err(e),
			None => Ok(()),
		}
	}

	/// Names of tasks still running in this group and its descendants.
	#[must_use]
	pub fn running_names(&self) -> String {
		let mut names = Vec::new();
		self.inner.collect_names(&mut names);
		names.join(",")
	}
}

impl Default for Group {
	fn default() -> Self {
		Self::new()
	}
}

impl Inner {
	fn exit(&self, err: Arc<Error>) {
		{
			let mut slot = self.err.lock();
			if slot.is_some() {
				return;
			}
			*slot = Some(err.clone());
		}
		self.exited.set();
		let on_exit = self.on_exit.lock().take();
		if let Some(on_exit) = on_exit {
			on_exit();
		}
		let sons: Vec<Arc<Inner>> = self.sons.lock().iter().filter_map(Weak::upgrade).collect();
		for son in sons {
			son.exit(err.clone());
		}
	}

	fn add_running(self: &Arc<Self>) {
		let mut node = Some(self);
		while let Some(n) = node {
			n.running.fetch_add(1, Ordering::SeqCst);
			node = n.father.as_ref();
		}
	}

	fn sub_running(self: &Arc<Self>) {
		let mut node = Some(self);
		while let Some(n) = node {
			if n.running.fetch_sub(1, Ordering::SeqCst) == 1 {
				n.idle.notify_waiters();
			}
			node = n.father.as_ref();
		}
	}

	fn collect_names(&self, out: &mut Vec<String>) {
		for (name, count) in self.task_names.lock().iter() {
			if *count > 0 {
				out.push(format!("{}({})", name, count));
			}
		}
		let sons: Vec<Arc<Inner>> = self.sons.lock().iter().filter_map(Weak::upgrade).collect();
		for son in sons {
			son.collect_names(out);
		}
	}
}

/// Keeps a task counted while it is alive, including when it is
/// cancelled or unwinds.
struct TaskGuard {
	inner: Arc<Inner>,
	name: Tag,
}

impl TaskGuard {
	fn new(inner: Arc<Inner>, name: Tag) -> Self {
		inner.add_running();
		*inner.task_names.lock().entry(name.clone()).or_insert(0) += 1;
		Self { inner, name }
	}
}

impl Drop for TaskGuard {
	fn drop(&mut self) {
		if std::thread::panicking() {
			self.inner.exit(Arc::new(Error::Other(
				format!("task '{}' panicked", self.name).into(),
			)));
		}
		{
			let mut names = self.inner.task_names.lock();
			if let Some(count) = names.get_mut(&self.name) {
				*count -= 1;
				if *count == 0 {
					names.remove(&self.name);
				}
			}
		}
		self.inner.sub_running();
	}
}

#[cfg(test)]
mod tests {
	use super::Group;
	use crate::Error;
	use std::{
		sync::{
			atomic::{AtomicUsize, Ordering},
			Arc,
		},
		time::Duration,
	};

	const WAIT: Duration = Duration::from_secs(2);

	#[tokio::test]
	async fn test_wait_without_error() {
		let g = Group::new();
		let counter = Arc::new(AtomicUsize::new(0));
		for _ in 0..4 {
			let counter = counter.clone();
			g.go("inc", async move {
				counter.fetch_add(1, Ordering::SeqCst);
				Ok(())
			});
		}
		tokio::time::timeout(WAIT, g.wait())
			.await
			.unwrap()
			.unwrap();
		assert_eq!(counter.load(Ordering::SeqCst), 4);
		assert!(!g.is_exited());
	}

	#[tokio::test]
	async fn test_first_error_wins() {
		let g = Group::new();
		g.go("fail", async { Err(Error::PingTimeout) });
		g.go("forever", async {
			futures::future::pending::<()>().await;
			Ok(())
		});
		let err = tokio::time::timeout(WAIT, g.wait())
			.await
			.unwrap()
			.unwrap_err();
		assert!(matches!(*err, Error::PingTimeout));
		g.exit(Error::Inactive);
		assert!(matches!(*g.error().unwrap(), Error::PingTimeout));
	}

	#[tokio::test]
	async fn test_exit_cascades_to_sons() {
		let father = Group::new();
		let son = father.son(|| {});
		let grandson = son.son(|| {});
		grandson.go("forever", async {
			futures::future::pending::<()>().await;
			Ok(())
		});
		assert_eq!(father.running(), 1);
		father.stop();
		tokio::time::timeout(WAIT, father.wait())
			.await
			.unwrap()
			.unwrap_err();
		assert!(son.is_exited());
		assert!(grandson.is_exited());
		assert!(matches!(*grandson.error().unwrap(), Error::Stop));
		assert_eq!(father.running(), 0);
	}

	#[tokio::test]
	async fn test_son_error_does_not_exit_father() {
		let father = Group::new();
		let son = father.son(|| {});
		son.go("fail", async { Err(Error::NeedClose) });
		let err = tokio::time::timeout(WAIT, son.wait())
			.await
			.unwrap()
			.unwrap_err();
		assert!(matches!(*err, Error::NeedClose));
		assert!(!father.is_exited());
	}

	#[tokio::test]
	async fn test_on_exit_runs_once() {
		let hits = Arc::new(AtomicUsize::new(0));
		let g = {
			let hits = hits.clone();
			Group::with_father(None, move || {
				hits.fetch_add(1, Ordering::SeqCst);
			})
		};
		g.stop();
		g.stop();
		g.exit(Error::Inactive);
		assert_eq!(hits.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn test_son_of_exited_father_exits() {
		let father = Group::new();
		father.stop();
		let son = father.son(|| {});
		assert!(son.is_exited());
		let ran = Arc::new(AtomicUsize::new(0));
		{
			let ran = ran.clone();
			son.go("never", async move {
				ran.fetch_add(1, Ordering::SeqCst);
				Ok(())
			});
		}
		tokio::time::timeout(WAIT, son.wait())
			.await
			.unwrap()
			.unwrap_err();
		assert_eq!(ran.load(Ordering::SeqCst), 0);
	}

	#[tokio::test]
	async fn test_done_after_exit() {
		let g = Group::new();
		g.stop();
		tokio::time::timeout(WAIT, g.done()).await.unwrap();
	}
}

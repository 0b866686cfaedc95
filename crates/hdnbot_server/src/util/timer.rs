#![forbid(unsafe_code)]

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;

/// At most one pending delayed task.
///
/// Arming cancels whatever was pending. A task that ends up re-arming its own
/// slot must hand that work to `tokio::spawn`, otherwise the re-arm aborts it.
#[derive(Debug, Default)]
pub struct TimerSlot {
	handle: Option<JoinHandle<()>>,
}

impl TimerSlot {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn arm<F>(&mut self, delay: Duration, task: F)
	where
		F: Future<Output = ()> + Send + 'static,
	{
		self.cancel();
		self.handle = Some(tokio::spawn(async move {
			tokio::time::sleep(delay).await;
			task.await;
		}));
	}

	/// Returns true if a task was still pending.
	pub fn cancel(&mut self) -> bool {
		match self.handle.take() {
			Some(handle) => {
				let pending = !handle.is_finished();
				handle.abort();
				pending
			}
			None => false,
		}
	}

	pub fn is_pending(&self) -> bool {
		self.handle.as_ref().is_some_and(|h| !h.is_finished())
	}
}

impl Drop for TimerSlot {
	fn drop(&mut self) {
		self.cancel();
	}
}

/// Uniform delay in `[0, max)`. Zero when `max` is zero.
pub fn uniform_below(max: Duration) -> Duration {
	let max_ms = max.as_millis() as u64;
	if max_ms == 0 {
		return Duration::ZERO;
	}
	Duration::from_millis(rand::rng().random_range(0..max_ms))
}

/// `base` plus a uniform jitter in `[0, jitter)`.
pub fn jittered(base: Duration, jitter: Duration) -> Duration {
	base + uniform_below(jitter)
}

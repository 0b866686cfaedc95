#![forbid(unsafe_code)]

//! Reward id to redemption listener routing.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use hdnbot_domain::{Redemption, RewardId};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

#[async_trait]
pub trait RedemptionListener: Send + Sync {
	async fn on_redemption(&self, redemption: &Redemption) -> anyhow::Result<()>;
}

#[derive(Clone)]
struct Binding {
	name: String,
	listener: Arc<dyn RedemptionListener>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
	Added,
	Replaced,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
	pub invoked: usize,
	pub failed: usize,
}

/// Listeners per reward id. A name is registered at most once per reward.
#[derive(Default)]
pub struct ListenerRegistry {
	bindings: RwLock<HashMap<RewardId, Vec<Binding>>>,
}

impl ListenerRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Register `listener` for `reward_id`, replacing one of the same name.
	pub fn upsert(&self, reward_id: RewardId, name: &str, listener: Arc<dyn RedemptionListener>) -> Registration {
		let mut guard = self.bindings.write();
		let bindings = guard.entry(reward_id.clone()).or_default();

		if let Some(existing) = bindings.iter_mut().find(|b| b.name == name) {
			existing.listener = listener;
			debug!(reward_id = %reward_id, listener = name, "listener replaced");
			return Registration::Replaced;
		}

		bindings.push(Binding {
			name: name.to_string(),
			listener,
		});
		debug!(reward_id = %reward_id, listener = name, "listener registered");
		Registration::Added
	}

	/// Drop every listener of `reward_id`. Returns how many were removed.
	pub fn remove_reward(&self, reward_id: &RewardId) -> usize {
		self.bindings.write().remove(reward_id).map(|b| b.len()).unwrap_or(0)
	}

	pub fn listener_names(&self, reward_id: &RewardId) -> Vec<String> {
		self.bindings
			.read()
			.get(reward_id)
			.map(|b| b.iter().map(|b| b.name.clone()).collect())
			.unwrap_or_default()
	}

	pub fn is_empty(&self) -> bool {
		self.bindings.read().values().all(Vec::is_empty)
	}

	/// Run every listener of the redemption's reward in registration order.
	///
	/// Each listener runs in its own task; an error or panic in one is logged
	/// and does not affect the others.
	pub async fn dispatch(&self, redemption: Redemption) -> DispatchReport {
		let reward_id = redemption.reward_id().clone();
		let bindings = self.bindings.read().get(&reward_id).cloned().unwrap_or_default();
		let mut report = DispatchReport::default();

		if bindings.is_empty() {
			debug!(reward_id = %reward_id, title = %redemption.reward.title, "redemption for reward without listeners");
			metrics::counter!("hdnbot_redemptions_unrouted_total").increment(1);
			return report;
		}

		let redemption = Arc::new(redemption);
		for binding in bindings {
			report.invoked += 1;
			let listener = Arc::clone(&binding.listener);
			let event = Arc::clone(&redemption);
			let outcome = tokio::spawn(async move { listener.on_redemption(&event).await }).await;

			match outcome {
				Ok(Ok(())) => {}
				Ok(Err(e)) => {
					report.failed += 1;
					metrics::counter!("hdnbot_listener_failures_total").increment(1);
					error!(reward_id = %reward_id, listener = %binding.name, error = ?e, "redemption listener failed");
				}
				Err(e) => {
					report.failed += 1;
					metrics::counter!("hdnbot_listener_failures_total").increment(1);
					error!(reward_id = %reward_id, listener = %binding.name, error = %e, "redemption listener panicked");
				}
			}
		}

		metrics::counter!("hdnbot_redemptions_dispatched_total").increment(1);
		report
	}
}

/// Drain `rx`, dispatching one redemption at a time.
pub fn spawn_dispatcher(registry: Arc<ListenerRegistry>, mut rx: mpsc::Receiver<Redemption>) -> JoinHandle<()> {
	tokio::spawn(async move {
		while let Some(redemption) = rx.recv().await {
			debug!(
				redemption_id = %redemption.id,
				user = %redemption.user.login,
				reward = %redemption.reward.title,
				"redemption received"
			);
			registry.dispatch(redemption).await;
		}
		info!("redemption dispatcher stopped");
	})
}

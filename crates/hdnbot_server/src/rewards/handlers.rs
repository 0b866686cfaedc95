#![forbid(unsafe_code)]

//! Redemption listeners for each kind of reward-backed unit.

use std::sync::Arc;

use async_trait::async_trait;
use hdnbot_domain::{Incentive, Redemption};
use tracing::{info, warn};

use super::RewardControls;
use super::announce::{Announcer, completion_message, threshold_message};
use crate::registry::RedemptionListener;
use crate::store::Store;

/// Progress percentages announced on the way to an incentive's cap.
pub const THRESHOLDS: [u32; 3] = [25, 50, 75];

/// Thresholds passed when votes go from `old` to `new` out of `max`.
///
/// A threshold `t` is crossed when `old < t% of max <= new`.
pub fn crossed_thresholds(old: u32, new: u32, max: u32) -> Vec<u32> {
	if max == 0 {
		return Vec::new();
	}
	let (old, new, max) = (u64::from(old) * 100, u64::from(new) * 100, u64::from(max));
	THRESHOLDS
		.into_iter()
		.filter(|&t| {
			let mark = u64::from(t) * max;
			old < mark && mark <= new
		})
		.collect()
}

fn failed_vote(redemption: &Redemption, kind: &'static str) {
	metrics::counter!("hdnbot_failed_votes_total", "kind" => kind).increment(1);
	warn!(
		reward_id = %redemption.reward_id(),
		redemption_id = %redemption.id,
		user = %redemption.user.login,
		kind,
		"failed vote: no matching unit"
	);
}

/// Counts one vote per redemption toward an incentive's cap.
pub struct IncentiveVotes {
	store: Arc<dyn Store>,
	controls: Arc<RewardControls>,
	announcer: Arc<dyn Announcer>,
}

impl IncentiveVotes {
	pub fn new(store: Arc<dyn Store>, controls: Arc<RewardControls>, announcer: Arc<dyn Announcer>) -> Self {
		Self {
			store,
			controls,
			announcer,
		}
	}

	async fn announce(&self, text: String) {
		if let Err(e) = self.announcer.announce(&text).await {
			warn!(error = ?e, %text, "announcement failed");
		}
	}

	async fn complete(&self, incentive: &Incentive) -> anyhow::Result<()> {
		self.store.set_incentive_closed(incentive.id, true).await?;

		if let Some(reward_id) = incentive.reward.reward_id() {
			if self.controls.usable() {
				if let Err(e) = self.controls.set_paused(reward_id, true).await {
					warn!(incentive_id = %incentive.id, %reward_id, error = ?e, "could not pause completed incentive");
				}
			} else {
				warn!(incentive_id = %incentive.id, %reward_id, "broadcaster token unusable; completed incentive stays unpaused until resync");
			}
		}

		info!(incentive_id = %incentive.id, name = %incentive.name, votes = incentive.current_votes, "incentive met");
		self.announce(completion_message(&incentive.name)).await;
		Ok(())
	}
}

#[async_trait]
impl RedemptionListener for IncentiveVotes {
	async fn on_redemption(&self, redemption: &Redemption) -> anyhow::Result<()> {
		let reward_id = redemption.reward_id();

		let Some(before) = self.store.incentive_by_reward(reward_id).await? else {
			failed_vote(redemption, "incentive");
			return Ok(());
		};
		if !self.store.add_incentive_votes(reward_id, 1).await? {
			failed_vote(redemption, "incentive");
			return Ok(());
		}
		let Some(after) = self.store.incentive_by_reward(reward_id).await? else {
			return Ok(());
		};

		metrics::counter!("hdnbot_votes_total", "kind" => "incentive").increment(1);
		info!(
			incentive_id = %after.id,
			user = %redemption.user.login,
			votes = after.current_votes,
			max = after.max_votes,
			"incentive vote"
		);

		if after.is_complete() {
			if !before.is_complete() {
				self.complete(&after).await?;
			}
			return Ok(());
		}

		for percent in crossed_thresholds(before.current_votes, after.current_votes, after.max_votes) {
			self.announce(threshold_message(&after.name, percent)).await;
		}
		Ok(())
	}
}

/// Counts a vote for one option of a closed-entry choice.
pub struct OptionVotes {
	store: Arc<dyn Store>,
}

impl OptionVotes {
	pub fn new(store: Arc<dyn Store>) -> Self {
		Self { store }
	}
}

#[async_trait]
impl RedemptionListener for OptionVotes {
	async fn on_redemption(&self, redemption: &Redemption) -> anyhow::Result<()> {
		if !self.store.add_option_votes(redemption.reward_id(), 1).await? {
			failed_vote(redemption, "option");
			return Ok(());
		}
		metrics::counter!("hdnbot_votes_total", "kind" => "option").increment(1);
		info!(reward_id = %redemption.reward_id(), user = %redemption.user.login, "option vote");
		Ok(())
	}
}

/// Turns free-text input into a vote for the option of that name, creating it on first use.
pub struct OpenEntryVotes {
	store: Arc<dyn Store>,
}

impl OpenEntryVotes {
	pub fn new(store: Arc<dyn Store>) -> Self {
		Self { store }
	}
}

#[async_trait]
impl RedemptionListener for OpenEntryVotes {
	async fn on_redemption(&self, redemption: &Redemption) -> anyhow::Result<()> {
		let Some(choice) = self.store.choice_by_reward(redemption.reward_id()).await? else {
			failed_vote(redemption, "open_entry");
			return Ok(());
		};
		let Some(entry) = redemption.trimmed_input() else {
			warn!(choice_id = %choice.id, user = %redemption.user.login, "open-entry redemption without input");
			metrics::counter!("hdnbot_failed_votes_total", "kind" => "open_entry").increment(1);
			return Ok(());
		};

		let votes = self.store.add_open_entry_vote(choice.id, entry).await?;
		metrics::counter!("hdnbot_votes_total", "kind" => "open_entry").increment(1);
		info!(choice_id = %choice.id, user = %redemption.user.login, %entry, votes, "open-entry vote");
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn single_step_crossings() {
		assert_eq!(crossed_thresholds(4, 5, 10), vec![50]);
		assert_eq!(crossed_thresholds(5, 6, 10), Vec::<u32>::new());
		assert_eq!(crossed_thresholds(2, 3, 10), vec![25]);
		assert_eq!(crossed_thresholds(7, 8, 10), vec![75]);
	}

	#[test]
	fn jump_emits_every_crossed_threshold() {
		assert_eq!(crossed_thresholds(0, 1, 2), vec![25, 50]);
		assert_eq!(crossed_thresholds(0, 9, 10), vec![25, 50, 75]);
	}

	#[test]
	fn zero_cap_never_crosses() {
		assert!(crossed_thresholds(0, 5, 0).is_empty());
	}

	proptest::proptest! {
		#[test]
		fn counting_to_cap_crosses_each_threshold_once(max in 1u32..500) {
			let mut seen = Vec::new();
			for votes in 0..max {
				seen.extend(crossed_thresholds(votes, votes + 1, max));
			}
			proptest::prop_assert_eq!(seen, THRESHOLDS.to_vec());
		}

		#[test]
		fn crossing_matches_definition(old in 0u32..1000, step in 0u32..1000, max in 1u32..1000) {
			let new = old + step;
			let crossed = crossed_thresholds(old, new, max);
			for t in THRESHOLDS {
				let mark = u64::from(t) * u64::from(max);
				let expected = u64::from(old) * 100 < mark && mark <= u64::from(new) * 100;
				proptest::prop_assert_eq!(crossed.contains(&t), expected);
			}
		}
	}
}

#![forbid(unsafe_code)]

//! Keeps incentives and choices backed by channel-points rewards.
//!
//! A reward-backed unit is an incentive, an option of a closed-entry choice, or
//! an open-entry choice. [`RewardSync::resync`] creates a reward for every unit
//! that has none, aligns pause state, and binds the unit's listener. Passes are
//! serialized so two passes never both create a reward for the same unit.

mod announce;
mod handlers;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use hdnbot_domain::{
	Choice, ChoiceId, ChoiceOption, Incentive, IncentiveId, NewReward, OptionId, RemoteReward, RewardBinding, RewardId,
	TokenKind,
};
use hdnbot_platform::RewardCatalog;
use tracing::{debug, error, info, warn};

pub use announce::{Announcer, HelixChatAnnouncer};
use handlers::{IncentiveVotes, OpenEntryVotes, OptionVotes};

use crate::identity::BroadcasterIdentity;
use crate::registry::{ListenerRegistry, RedemptionListener};
use crate::store::{NewChoice, NewIncentive, Store};
use crate::tokens::TokenManager;
use crate::util::truncate_chars;

#[cfg(test)]
mod rewards_tests;

pub const INCENTIVE_LISTENER: &str = "incentive";
pub const OPTION_LISTENER: &str = "option";
pub const OPEN_ENTRY_LISTENER: &str = "open-entry";

const MAX_TITLE_CHARS: usize = 45;
const MAX_PROMPT_CHARS: usize = 200;

/// Parameters of the rewards this bot creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RewardSettings {
	pub cost: u32,
	/// Cap used when an incentive is created without one.
	pub default_max_votes: u32,
}

impl Default for RewardSettings {
	fn default() -> Self {
		Self {
			cost: 100,
			default_max_votes: 100,
		}
	}
}

/// Reward catalog calls, refused while the broadcaster token is unusable.
pub struct RewardControls {
	catalog: Arc<dyn RewardCatalog>,
	tokens: Arc<TokenManager>,
	identity: Arc<BroadcasterIdentity>,
}

impl RewardControls {
	pub fn new(catalog: Arc<dyn RewardCatalog>, tokens: Arc<TokenManager>, identity: Arc<BroadcasterIdentity>) -> Self {
		Self {
			catalog,
			tokens,
			identity,
		}
	}

	pub fn usable(&self) -> bool {
		self.tokens.has_capability(TokenKind::Broadcaster)
	}

	async fn broadcaster_id(&self) -> anyhow::Result<String> {
		if !self.usable() {
			anyhow::bail!(
				"broadcaster token is {:?}; reward calls are disabled",
				self.tokens.capability(TokenKind::Broadcaster)
			);
		}
		self.identity.id().await
	}

	pub async fn list(&self) -> anyhow::Result<Vec<RemoteReward>> {
		let broadcaster_id = self.broadcaster_id().await?;
		let rewards = self.catalog.list_rewards(&broadcaster_id).await.context("list rewards")?;
		Ok(rewards)
	}

	pub async fn create(&self, reward: &NewReward) -> anyhow::Result<RemoteReward> {
		let broadcaster_id = self.broadcaster_id().await?;
		let created = self
			.catalog
			.create_reward(&broadcaster_id, reward)
			.await
			.with_context(|| format!("create reward {:?}", reward.title))?;
		metrics::counter!("hdnbot_rewards_created_total").increment(1);
		info!(reward_id = %created.id, title = %created.title, "reward created");
		Ok(created)
	}

	pub async fn set_paused(&self, reward_id: &RewardId, paused: bool) -> anyhow::Result<()> {
		let broadcaster_id = self.broadcaster_id().await?;
		self.catalog
			.set_reward_paused(&broadcaster_id, reward_id, paused)
			.await
			.with_context(|| format!("set reward {reward_id} paused={paused}"))?;
		if paused {
			metrics::counter!("hdnbot_rewards_paused_total").increment(1);
		} else {
			metrics::counter!("hdnbot_rewards_resumed_total").increment(1);
		}
		debug!(%reward_id, paused, "reward pause state set");
		Ok(())
	}

	/// Delete a reward. One that is already gone counts as deleted.
	pub async fn delete(&self, reward_id: &RewardId) -> anyhow::Result<()> {
		let broadcaster_id = self.broadcaster_id().await?;
		match self.catalog.delete_reward(&broadcaster_id, reward_id).await {
			Ok(()) => {
				metrics::counter!("hdnbot_rewards_deleted_total").increment(1);
				info!(%reward_id, "reward deleted");
				Ok(())
			}
			Err(e) if e.is_not_found() => {
				info!(%reward_id, "reward already gone");
				Ok(())
			}
			Err(e) => Err(anyhow::Error::new(e).context(format!("delete reward {reward_id}"))),
		}
	}
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResyncReport {
	pub created: usize,
	pub paused: usize,
	pub resumed: usize,
	pub bound: usize,
	/// The pass did nothing because the broadcaster token is unusable.
	pub skipped: bool,
}

#[derive(Debug, Clone)]
enum RewardUnit {
	Incentive(Incentive),
	Option {
		choice_name: String,
		choice_closed: bool,
		option: ChoiceOption,
	},
	OpenEntry(Choice),
}

impl RewardUnit {
	fn from_choice(choice: Choice) -> Vec<RewardUnit> {
		if choice.has_open_entry {
			return vec![RewardUnit::OpenEntry(choice)];
		}
		choice
			.options
			.into_iter()
			.map(|option| RewardUnit::Option {
				choice_name: choice.name.clone(),
				choice_closed: choice.is_closed,
				option,
			})
			.collect()
	}

	fn binding(&self) -> &RewardBinding {
		match self {
			RewardUnit::Incentive(i) => &i.reward,
			RewardUnit::Option { option, .. } => &option.reward,
			RewardUnit::OpenEntry(c) => &c.reward,
		}
	}

	fn wants_paused(&self) -> bool {
		match self {
			RewardUnit::Incentive(i) => i.wants_paused(),
			RewardUnit::Option { choice_closed, .. } => *choice_closed,
			RewardUnit::OpenEntry(c) => c.wants_paused(),
		}
	}

	fn listener_name(&self) -> &'static str {
		match self {
			RewardUnit::Incentive(_) => INCENTIVE_LISTENER,
			RewardUnit::Option { .. } => OPTION_LISTENER,
			RewardUnit::OpenEntry(_) => OPEN_ENTRY_LISTENER,
		}
	}

	fn label(&self) -> String {
		match self {
			RewardUnit::Incentive(i) => format!("incentive {} ({})", i.id, i.name),
			RewardUnit::Option { choice_name, option, .. } => {
				format!("option {} ({} - {})", option.id, choice_name, option.name)
			}
			RewardUnit::OpenEntry(c) => format!("open-entry choice {} ({})", c.id, c.name),
		}
	}

	fn new_reward(&self, settings: &RewardSettings) -> NewReward {
		let (title, prompt, input) = match self {
			RewardUnit::Incentive(i) => (
				i.name.clone(),
				format!("{} - ID: {}", i.description, i.id),
				false,
			),
			RewardUnit::Option {
				choice_name, option, ..
			} => (
				format!("{} - {}", choice_name, option.name),
				format!("Vote for \"{}\" in the {} choice - ID: {}", option.name, choice_name, option.id),
				false,
			),
			RewardUnit::OpenEntry(c) => (
				format!("{} - open Entry!", c.name),
				format!("{} - open Entry! ID: {}", c.description, c.id),
				true,
			),
		};

		NewReward {
			title: truncate_chars(&title, MAX_TITLE_CHARS),
			prompt: truncate_chars(&prompt, MAX_PROMPT_CHARS),
			cost: settings.cost,
			is_user_input_required: input,
			should_redemptions_skip_request_queue: true,
		}
	}

	async fn bind(&self, store: &dyn Store, reward_id: &RewardId) -> anyhow::Result<()> {
		match self {
			RewardUnit::Incentive(i) => store.bind_incentive(i.id, reward_id).await,
			RewardUnit::Option { option, .. } => store.bind_option(option.id, reward_id).await,
			RewardUnit::OpenEntry(c) => store.bind_choice(c.id, reward_id).await,
		}
	}
}

/// Reward reconciliation and the unit lifecycle operations built on it.
pub struct RewardSync {
	controls: Arc<RewardControls>,
	store: Arc<dyn Store>,
	registry: Arc<ListenerRegistry>,
	settings: RewardSettings,
	incentive_votes: Arc<dyn RedemptionListener>,
	option_votes: Arc<dyn RedemptionListener>,
	open_entry_votes: Arc<dyn RedemptionListener>,
	gate: tokio::sync::Mutex<()>,
}

impl RewardSync {
	pub fn new(
		controls: Arc<RewardControls>,
		store: Arc<dyn Store>,
		registry: Arc<ListenerRegistry>,
		announcer: Arc<dyn Announcer>,
		settings: RewardSettings,
	) -> Self {
		Self {
			incentive_votes: Arc::new(IncentiveVotes::new(
				Arc::clone(&store),
				Arc::clone(&controls),
				announcer,
			)),
			option_votes: Arc::new(OptionVotes::new(Arc::clone(&store))),
			open_entry_votes: Arc::new(OpenEntryVotes::new(Arc::clone(&store))),
			controls,
			store,
			registry,
			settings,
			gate: tokio::sync::Mutex::new(()),
		}
	}

	fn listener_for(&self, unit: &RewardUnit) -> Arc<dyn RedemptionListener> {
		match unit {
			RewardUnit::Incentive(_) => Arc::clone(&self.incentive_votes),
			RewardUnit::Option { .. } => Arc::clone(&self.option_votes),
			RewardUnit::OpenEntry(_) => Arc::clone(&self.open_entry_votes),
		}
	}

	fn listen(&self, unit: &RewardUnit, reward_id: RewardId) {
		self.registry
			.upsert(reward_id, unit.listener_name(), self.listener_for(unit));
	}

	async fn units(&self) -> anyhow::Result<Vec<RewardUnit>> {
		let mut units: Vec<RewardUnit> = self
			.store
			.incentives()
			.await
			.context("load incentives")?
			.into_iter()
			.map(RewardUnit::Incentive)
			.collect();
		for choice in self.store.choices().await.context("load choices")? {
			units.extend(RewardUnit::from_choice(choice));
		}
		Ok(units)
	}

	/// Create the unit's reward, record the binding and pause it if the unit is closed.
	async fn materialize(&self, unit: &RewardUnit) -> anyhow::Result<RewardId> {
		let created = self.controls.create(&unit.new_reward(&self.settings)).await?;

		if let Err(e) = unit.bind(self.store.as_ref(), &created.id).await {
			error!(reward_id = %created.id, unit = %unit.label(), error = ?e, "reward created but binding not stored");
			return Err(e.context(format!("store binding for {}", unit.label())));
		}

		if unit.wants_paused() && !created.is_paused {
			self.controls.set_paused(&created.id, true).await?;
		}

		info!(reward_id = %created.id, unit = %unit.label(), "unit bound to new reward");
		Ok(created.id)
	}

	/// Align every unit with the remote catalog.
	///
	/// A catalog error aborts the pass; units handled before it keep their changes.
	pub async fn resync(&self) -> anyhow::Result<ResyncReport> {
		let _pass = self.gate.lock().await;
		let mut report = ResyncReport::default();

		if !self.controls.usable() {
			warn!("broadcaster token unusable; skipping reward resync");
			report.skipped = true;
			return Ok(report);
		}

		let remote: HashMap<RewardId, RemoteReward> = self
			.controls
			.list()
			.await?
			.into_iter()
			.map(|r| (r.id.clone(), r))
			.collect();

		for unit in self.units().await? {
			let existing = unit.binding().reward_id().and_then(|id| remote.get(id));

			let reward_id = match existing {
				Some(reward) => {
					let want = unit.wants_paused();
					if reward.is_paused != want {
						self.controls.set_paused(&reward.id, want).await?;
						if want {
							report.paused += 1;
						} else {
							report.resumed += 1;
						}
					}
					reward.id.clone()
				}
				None => {
					if let Some(stale) = unit.binding().reward_id() {
						let dropped = self.registry.remove_reward(stale);
						warn!(
							reward_id = %stale,
							unit = %unit.label(),
							dropped,
							"bound reward missing from catalog; recreating"
						);
					}
					let id = self.materialize(&unit).await?;
					report.created += 1;
					id
				}
			};

			self.listen(&unit, reward_id);
			report.bound += 1;
		}

		info!(
			created = report.created,
			paused = report.paused,
			resumed = report.resumed,
			bound = report.bound,
			"reward resync finished"
		);
		Ok(report)
	}

	/// Create an incentive and, when the broadcaster token allows, its reward.
	pub async fn create_incentive(
		&self,
		name: &str,
		description: &str,
		max_votes: Option<u32>,
	) -> anyhow::Result<Incentive> {
		let name = name.trim();
		if name.is_empty() {
			anyhow::bail!("incentive name is empty");
		}
		let max_votes = max_votes.unwrap_or(self.settings.default_max_votes);
		if max_votes == 0 {
			anyhow::bail!("incentive cap must be at least 1");
		}

		let _pass = self.gate.lock().await;
		let id = self
			.store
			.insert_incentive(NewIncentive {
				name,
				description: description.trim(),
				max_votes,
			})
			.await
			.context("insert incentive")?;
		let incentive = self.load_incentive(id).await?;

		if !self.controls.usable() {
			info!(incentive_id = %id, "broadcaster token unusable; reward will be created on next resync");
			return Ok(incentive);
		}

		let unit = RewardUnit::Incentive(incentive);
		let reward_id = self.materialize(&unit).await?;
		self.listen(&unit, reward_id);
		self.load_incentive(id).await
	}

	/// Create a choice. Open-entry choices get their reward right away; options
	/// of a closed-entry choice get theirs on the next resync.
	pub async fn create_choice(&self, name: &str, description: &str, has_open_entry: bool) -> anyhow::Result<Choice> {
		let name = name.trim();
		if name.is_empty() {
			anyhow::bail!("choice name is empty");
		}

		let _pass = self.gate.lock().await;
		let id = self
			.store
			.insert_choice(NewChoice {
				name,
				description: description.trim(),
				has_open_entry,
			})
			.await
			.context("insert choice")?;
		let choice = self.load_choice(id).await?;

		if !has_open_entry {
			return Ok(choice);
		}
		if !self.controls.usable() {
			info!(choice_id = %id, "broadcaster token unusable; reward will be created on next resync");
			return Ok(choice);
		}

		let unit = RewardUnit::OpenEntry(choice);
		let reward_id = self.materialize(&unit).await?;
		self.listen(&unit, reward_id);
		self.load_choice(id).await
	}

	/// Add options to a closed-entry choice. Rewards follow on the next resync.
	pub async fn add_options_to_choice(&self, choice_id: ChoiceId, names: &[String]) -> anyhow::Result<Vec<OptionId>> {
		let choice = self.load_choice(choice_id).await?;
		if choice.has_open_entry {
			anyhow::bail!("choice {choice_id} takes its options from viewers");
		}

		let mut ids = Vec::with_capacity(names.len());
		for name in names.iter().map(|n| n.trim()).filter(|n| !n.is_empty()) {
			let id = self
				.store
				.insert_option(choice_id, name)
				.await
				.with_context(|| format!("add option {name:?} to choice {choice_id}"))?;
			ids.push(id);
		}
		info!(%choice_id, added = ids.len(), "options added");
		Ok(ids)
	}

	/// Pause the incentive's reward, then mark it closed.
	pub async fn close_incentive(&self, id: IncentiveId) -> anyhow::Result<Incentive> {
		let _pass = self.gate.lock().await;
		let incentive = self.load_incentive(id).await?;
		self.pause_rewards(incentive.reward.reward_id().into_iter()).await?;
		self.store.set_incentive_closed(id, true).await?;
		info!(incentive_id = %id, "incentive closed");
		self.load_incentive(id).await
	}

	/// Pause every reward of the choice, then mark it closed.
	pub async fn close_choice(&self, id: ChoiceId) -> anyhow::Result<Choice> {
		let _pass = self.gate.lock().await;
		let choice = self.load_choice(id).await?;
		self.pause_rewards(choice_rewards(&choice).into_iter()).await?;
		self.store.set_choice_closed(id, true).await?;
		info!(choice_id = %id, "choice closed");
		self.load_choice(id).await
	}

	/// Delete the incentive's reward, then the incentive.
	pub async fn delete_incentive(&self, id: IncentiveId) -> anyhow::Result<()> {
		let _pass = self.gate.lock().await;
		let incentive = self.load_incentive(id).await?;
		self.delete_rewards(incentive.reward.reward_id().into_iter()).await?;
		self.store.delete_incentive(id).await?;
		info!(incentive_id = %id, "incentive deleted");
		Ok(())
	}

	/// Delete every reward of the choice, then the choice and its options.
	pub async fn delete_choice(&self, id: ChoiceId) -> anyhow::Result<()> {
		let _pass = self.gate.lock().await;
		let choice = self.load_choice(id).await?;
		self.delete_rewards(choice_rewards(&choice).into_iter()).await?;
		self.store.delete_choice(id).await?;
		info!(choice_id = %id, "choice deleted");
		Ok(())
	}

	/// Rewards currently in the remote catalog.
	pub async fn list_rewards(&self) -> anyhow::Result<Vec<RemoteReward>> {
		self.controls.list().await
	}

	pub async fn incentive(&self, id: IncentiveId) -> anyhow::Result<Option<Incentive>> {
		self.store.incentive(id).await
	}

	pub async fn choice(&self, id: ChoiceId) -> anyhow::Result<Option<Choice>> {
		self.store.choice(id).await
	}

	async fn load_incentive(&self, id: IncentiveId) -> anyhow::Result<Incentive> {
		self.store
			.incentive(id)
			.await?
			.with_context(|| format!("no incentive with id {id}"))
	}

	async fn load_choice(&self, id: ChoiceId) -> anyhow::Result<Choice> {
		self.store
			.choice(id)
			.await?
			.with_context(|| format!("no choice with id {id}"))
	}

	/// Without a usable token the unit is closed locally and the next resync pauses it.
	async fn pause_rewards<'a>(&self, reward_ids: impl Iterator<Item = &'a RewardId>) -> anyhow::Result<()> {
		let usable = self.controls.usable();
		for reward_id in reward_ids {
			if usable {
				self.controls.set_paused(reward_id, true).await?;
			} else {
				warn!(%reward_id, "broadcaster token unusable; reward stays active until resync");
			}
		}
		Ok(())
	}

	async fn delete_rewards<'a>(&self, reward_ids: impl Iterator<Item = &'a RewardId>) -> anyhow::Result<()> {
		for reward_id in reward_ids {
			self.controls.delete(reward_id).await?;
			let removed = self.registry.remove_reward(reward_id);
			debug!(%reward_id, removed, "listeners removed");
		}
		Ok(())
	}
}

fn choice_rewards(choice: &Choice) -> Vec<&RewardId> {
	if choice.has_open_entry {
		return choice.reward.reward_id().into_iter().collect();
	}
	choice.options.iter().filter_map(|o| o.reward.reward_id()).collect()
}

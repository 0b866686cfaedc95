#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use hdnbot_domain::{
	Choice, ChoiceId, ChoiceOption, Incentive, IncentiveId, OptionId, RewardBinding, RewardId, TokenKind,
};
use tokio::sync::Mutex;

use super::{NewChoice, NewIncentive, Store, StoredToken};

#[derive(Debug, Default)]
struct MemoryState {
	tokens: HashMap<TokenKind, StoredToken>,
	admins: HashSet<String>,
	incentives: BTreeMap<IncentiveId, Incentive>,
	/// Choices are kept without options; `options` is the source of truth.
	choices: BTreeMap<ChoiceId, Choice>,
	options: BTreeMap<OptionId, ChoiceOption>,
	next_id: i64,
}

impl MemoryState {
	fn next_id(&mut self) -> i64 {
		self.next_id += 1;
		self.next_id
	}

	fn assemble(&self, choice: &Choice) -> Choice {
		let mut out = choice.clone();
		out.options = self
			.options
			.values()
			.filter(|o| o.choice_id == choice.id)
			.cloned()
			.collect();
		out
	}
}

/// Store that lives only as long as the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
	inner: Mutex<MemoryState>,
}

#[async_trait]
impl Store for MemoryStore {
	async fn load_token(&self, kind: TokenKind) -> anyhow::Result<Option<StoredToken>> {
		Ok(self.inner.lock().await.tokens.get(&kind).cloned())
	}

	async fn save_token(&self, kind: TokenKind, token: &StoredToken) -> anyhow::Result<()> {
		self.inner.lock().await.tokens.insert(kind, token.clone());
		Ok(())
	}

	async fn is_admin(&self, user_id: &str) -> anyhow::Result<bool> {
		Ok(self.inner.lock().await.admins.contains(user_id))
	}

	async fn add_admin(&self, user_id: &str) -> anyhow::Result<()> {
		self.inner.lock().await.admins.insert(user_id.to_string());
		Ok(())
	}

	async fn incentives(&self) -> anyhow::Result<Vec<Incentive>> {
		Ok(self.inner.lock().await.incentives.values().cloned().collect())
	}

	async fn incentive(&self, id: IncentiveId) -> anyhow::Result<Option<Incentive>> {
		Ok(self.inner.lock().await.incentives.get(&id).cloned())
	}

	async fn incentive_by_reward(&self, reward_id: &RewardId) -> anyhow::Result<Option<Incentive>> {
		let guard = self.inner.lock().await;
		Ok(guard
			.incentives
			.values()
			.find(|i| i.reward.reward_id() == Some(reward_id))
			.cloned())
	}

	async fn insert_incentive(&self, incentive: NewIncentive<'_>) -> anyhow::Result<IncentiveId> {
		let mut guard = self.inner.lock().await;
		let id = IncentiveId(guard.next_id());
		guard.incentives.insert(
			id,
			Incentive {
				id,
				name: incentive.name.to_string(),
				description: incentive.description.to_string(),
				reward: RewardBinding::Unbound,
				current_votes: 0,
				max_votes: incentive.max_votes,
				is_closed: false,
			},
		);
		Ok(id)
	}

	async fn bind_incentive(&self, id: IncentiveId, reward_id: &RewardId) -> anyhow::Result<()> {
		let mut guard = self.inner.lock().await;
		if let Some(incentive) = guard.incentives.get_mut(&id) {
			incentive.reward = RewardBinding::Bound(reward_id.clone());
		}
		Ok(())
	}

	async fn add_incentive_votes(&self, reward_id: &RewardId, votes: u32) -> anyhow::Result<bool> {
		let mut guard = self.inner.lock().await;
		let mut hit = false;
		for incentive in guard
			.incentives
			.values_mut()
			.filter(|i| i.reward.reward_id() == Some(reward_id))
		{
			incentive.current_votes = incentive.current_votes.saturating_add(votes);
			hit = true;
		}
		Ok(hit)
	}

	async fn set_incentive_closed(&self, id: IncentiveId, closed: bool) -> anyhow::Result<()> {
		let mut guard = self.inner.lock().await;
		if let Some(incentive) = guard.incentives.get_mut(&id) {
			incentive.is_closed = closed;
		}
		Ok(())
	}

	async fn delete_incentive(&self, id: IncentiveId) -> anyhow::Result<bool> {
		Ok(self.inner.lock().await.incentives.remove(&id).is_some())
	}

	async fn choices(&self) -> anyhow::Result<Vec<Choice>> {
		let guard = self.inner.lock().await;
		Ok(guard.choices.values().map(|c| guard.assemble(c)).collect())
	}

	async fn choice(&self, id: ChoiceId) -> anyhow::Result<Option<Choice>> {
		let guard = self.inner.lock().await;
		Ok(guard.choices.get(&id).map(|c| guard.assemble(c)))
	}

	async fn choice_by_reward(&self, reward_id: &RewardId) -> anyhow::Result<Option<Choice>> {
		let guard = self.inner.lock().await;
		Ok(guard
			.choices
			.values()
			.find(|c| c.has_open_entry && c.reward.reward_id() == Some(reward_id))
			.map(|c| guard.assemble(c)))
	}

	async fn insert_choice(&self, choice: NewChoice<'_>) -> anyhow::Result<ChoiceId> {
		let mut guard = self.inner.lock().await;
		let id = ChoiceId(guard.next_id());
		guard.choices.insert(
			id,
			Choice {
				id,
				name: choice.name.to_string(),
				description: choice.description.to_string(),
				has_open_entry: choice.has_open_entry,
				reward: RewardBinding::Unbound,
				is_closed: false,
				options: Vec::new(),
			},
		);
		Ok(id)
	}

	async fn bind_choice(&self, id: ChoiceId, reward_id: &RewardId) -> anyhow::Result<()> {
		let mut guard = self.inner.lock().await;
		if let Some(choice) = guard.choices.get_mut(&id) {
			choice.reward = RewardBinding::Bound(reward_id.clone());
		}
		Ok(())
	}

	async fn set_choice_closed(&self, id: ChoiceId, closed: bool) -> anyhow::Result<()> {
		let mut guard = self.inner.lock().await;
		if let Some(choice) = guard.choices.get_mut(&id) {
			choice.is_closed = closed;
		}
		Ok(())
	}

	async fn delete_choice(&self, id: ChoiceId) -> anyhow::Result<bool> {
		let mut guard = self.inner.lock().await;
		guard.options.retain(|_, o| o.choice_id != id);
		Ok(guard.choices.remove(&id).is_some())
	}

	async fn insert_option(&self, choice_id: ChoiceId, name: &str) -> anyhow::Result<OptionId> {
		let mut guard = self.inner.lock().await;
		if !guard.choices.contains_key(&choice_id) {
			anyhow::bail!("choice {choice_id} does not exist");
		}
		if guard
			.options
			.values()
			.any(|o| o.choice_id == choice_id && o.name.eq_ignore_ascii_case(name))
		{
			anyhow::bail!("choice {choice_id} already has an option named {name:?}");
		}
		let id = OptionId(guard.next_id());
		guard.options.insert(
			id,
			ChoiceOption {
				id,
				choice_id,
				name: name.to_string(),
				reward: RewardBinding::Unbound,
				votes: 0,
			},
		);
		Ok(id)
	}

	async fn bind_option(&self, id: OptionId, reward_id: &RewardId) -> anyhow::Result<()> {
		let mut guard = self.inner.lock().await;
		if let Some(option) = guard.options.get_mut(&id) {
			option.reward = RewardBinding::Bound(reward_id.clone());
		}
		Ok(())
	}

	async fn option_by_reward(&self, reward_id: &RewardId) -> anyhow::Result<Option<ChoiceOption>> {
		let guard = self.inner.lock().await;
		Ok(guard
			.options
			.values()
			.find(|o| o.reward.reward_id() == Some(reward_id))
			.cloned())
	}

	async fn add_option_votes(&self, reward_id: &RewardId, votes: u32) -> anyhow::Result<bool> {
		let mut guard = self.inner.lock().await;
		let mut hit = false;
		for option in guard
			.options
			.values_mut()
			.filter(|o| o.reward.reward_id() == Some(reward_id))
		{
			option.votes = option.votes.saturating_add(votes);
			hit = true;
		}
		Ok(hit)
	}

	async fn add_open_entry_vote(&self, choice_id: ChoiceId, name: &str) -> anyhow::Result<u32> {
		let mut guard = self.inner.lock().await;
		if let Some(option) = guard
			.options
			.values_mut()
			.find(|o| o.choice_id == choice_id && o.name.eq_ignore_ascii_case(name))
		{
			option.votes = option.votes.saturating_add(1);
			return Ok(option.votes);
		}

		let id = OptionId(guard.next_id());
		guard.options.insert(
			id,
			ChoiceOption {
				id,
				choice_id,
				name: name.to_string(),
				reward: RewardBinding::Unbound,
				votes: 1,
			},
		);
		Ok(1)
	}
}

#![forbid(unsafe_code)]

//! Operations reserved for admins of the bot.

use std::sync::Arc;

use anyhow::Context;
use hdnbot_domain::{Choice, ChoiceId, Incentive, IncentiveId, OptionId, RemoteReward};
use tracing::{info, warn};

use crate::bus::PubSubBus;
use crate::rewards::{ResyncReport, RewardSync};
use crate::store::Store;

#[derive(Debug, thiserror::Error)]
pub enum AdminError {
	#[error("user {0} is not an admin")]
	NotAdmin(String),

	#[error(transparent)]
	Failed(#[from] anyhow::Error),
}

pub type AdminResult<T> = Result<T, AdminError>;

pub struct AdminOps {
	store: Arc<dyn Store>,
	rewards: Arc<RewardSync>,
	bus: Arc<PubSubBus>,
}

impl AdminOps {
	pub fn new(store: Arc<dyn Store>, rewards: Arc<RewardSync>, bus: Arc<PubSubBus>) -> Self {
		Self { store, rewards, bus }
	}

	async fn authorize(&self, user_id: &str, op: &'static str) -> AdminResult<()> {
		let is_admin = self
			.store
			.is_admin(user_id)
			.await
			.with_context(|| format!("look up admin {user_id}"))?;
		if !is_admin {
			warn!(user_id, op, "admin operation refused");
			return Err(AdminError::NotAdmin(user_id.to_string()));
		}
		info!(user_id, op, "admin operation");
		Ok(())
	}

	pub async fn create_incentive(
		&self,
		user_id: &str,
		name: &str,
		description: &str,
		max_votes: Option<u32>,
	) -> AdminResult<Incentive> {
		self.authorize(user_id, "create_incentive").await?;
		Ok(self.rewards.create_incentive(name, description, max_votes).await?)
	}

	pub async fn create_choice(
		&self,
		user_id: &str,
		name: &str,
		description: &str,
		has_open_entry: bool,
	) -> AdminResult<Choice> {
		self.authorize(user_id, "create_choice").await?;
		Ok(self.rewards.create_choice(name, description, has_open_entry).await?)
	}

	pub async fn add_options(&self, user_id: &str, choice_id: ChoiceId, names: &[String]) -> AdminResult<Vec<OptionId>> {
		self.authorize(user_id, "add_options").await?;
		Ok(self.rewards.add_options_to_choice(choice_id, names).await?)
	}

	pub async fn close_incentive(&self, user_id: &str, id: IncentiveId) -> AdminResult<Incentive> {
		self.authorize(user_id, "close_incentive").await?;
		Ok(self.rewards.close_incentive(id).await?)
	}

	pub async fn close_choice(&self, user_id: &str, id: ChoiceId) -> AdminResult<Choice> {
		self.authorize(user_id, "close_choice").await?;
		Ok(self.rewards.close_choice(id).await?)
	}

	pub async fn delete_incentive(&self, user_id: &str, id: IncentiveId) -> AdminResult<()> {
		self.authorize(user_id, "delete_incentive").await?;
		Ok(self.rewards.delete_incentive(id).await?)
	}

	pub async fn delete_choice(&self, user_id: &str, id: ChoiceId) -> AdminResult<()> {
		self.authorize(user_id, "delete_choice").await?;
		Ok(self.rewards.delete_choice(id).await?)
	}

	pub async fn resync(&self, user_id: &str) -> AdminResult<ResyncReport> {
		self.authorize(user_id, "resync").await?;
		Ok(self.rewards.resync().await?)
	}

	pub async fn list_rewards(&self, user_id: &str) -> AdminResult<Vec<RemoteReward>> {
		self.authorize(user_id, "list_rewards").await?;
		Ok(self.rewards.list_rewards().await?)
	}

	/// Restart the PubSub session.
	pub async fn reconnect(&self, user_id: &str) -> AdminResult<()> {
		self.authorize(user_id, "reconnect").await?;
		Ok(self.bus.restart().await?)
	}

	/// Progress line of an incentive. Anyone may ask.
	pub async fn incentive_status(&self, id: IncentiveId) -> anyhow::Result<Option<String>> {
		Ok(self.rewards.incentive(id).await?.map(|i| i.progress_line()))
	}

	/// Options of a choice, best first. Anyone may ask.
	pub async fn choice_standings(&self, id: ChoiceId) -> anyhow::Result<Option<Vec<(String, u32)>>> {
		Ok(self
			.rewards
			.choice(id)
			.await?
			.map(|c| c.standings().into_iter().map(|o| (o.name.clone(), o.votes)).collect()))
	}
}

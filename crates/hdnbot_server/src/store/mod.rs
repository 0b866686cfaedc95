#![forbid(unsafe_code)]

//! Persistence for tokens, admins, incentives and choices.

mod memory;
mod sql;

use std::sync::Arc;

use async_trait::async_trait;
use hdnbot_domain::{Choice, ChoiceId, ChoiceOption, Incentive, IncentiveId, OptionId, RewardId, TokenKind};
use hdnbot_platform::SecretString;
use tracing::info;

pub use memory::MemoryStore;
pub use sql::SqlStore;


/// `database_url` value selecting the in-process store.
pub const MEMORY_DATABASE_URL: &str = "memory:";

/// A token pair as persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredToken {
	pub access_token: SecretString,
	pub refresh_token: Option<SecretString>,
	/// Unix seconds; `None` when the token does not expire.
	pub expires_at: Option<i64>,
}

/// Fields of a new incentive.
#[derive(Debug, Clone)]
pub struct NewIncentive<'a> {
	pub name: &'a str,
	pub description: &'a str,
	pub max_votes: u32,
}

/// Fields of a new choice.
#[derive(Debug, Clone)]
pub struct NewChoice<'a> {
	pub name: &'a str,
	pub description: &'a str,
	pub has_open_entry: bool,
}

#[async_trait]
pub trait Store: Send + Sync {
	async fn load_token(&self, kind: TokenKind) -> anyhow::Result<Option<StoredToken>>;

	async fn save_token(&self, kind: TokenKind, token: &StoredToken) -> anyhow::Result<()>;

	async fn is_admin(&self, user_id: &str) -> anyhow::Result<bool>;

	async fn add_admin(&self, user_id: &str) -> anyhow::Result<()>;

	async fn incentives(&self) -> anyhow::Result<Vec<Incentive>>;

	async fn incentive(&self, id: IncentiveId) -> anyhow::Result<Option<Incentive>>;

	async fn incentive_by_reward(&self, reward_id: &RewardId) -> anyhow::Result<Option<Incentive>>;

	async fn insert_incentive(&self, incentive: NewIncentive<'_>) -> anyhow::Result<IncentiveId>;

	async fn bind_incentive(&self, id: IncentiveId, reward_id: &RewardId) -> anyhow::Result<()>;

	/// Adds `votes` to the incentive bound to `reward_id`. False when none is bound.
	async fn add_incentive_votes(&self, reward_id: &RewardId, votes: u32) -> anyhow::Result<bool>;

	async fn set_incentive_closed(&self, id: IncentiveId, closed: bool) -> anyhow::Result<()>;

	async fn delete_incentive(&self, id: IncentiveId) -> anyhow::Result<bool>;

	/// All choices with their options.
	async fn choices(&self) -> anyhow::Result<Vec<Choice>>;

	async fn choice(&self, id: ChoiceId) -> anyhow::Result<Option<Choice>>;

	/// Open-entry choice bound to `reward_id`.
	async fn choice_by_reward(&self, reward_id: &RewardId) -> anyhow::Result<Option<Choice>>;

	async fn insert_choice(&self, choice: NewChoice<'_>) -> anyhow::Result<ChoiceId>;

	async fn bind_choice(&self, id: ChoiceId, reward_id: &RewardId) -> anyhow::Result<()>;

	async fn set_choice_closed(&self, id: ChoiceId, closed: bool) -> anyhow::Result<()>;

	/// Deletes the choice and its options.
	async fn delete_choice(&self, id: ChoiceId) -> anyhow::Result<bool>;

	async fn insert_option(&self, choice_id: ChoiceId, name: &str) -> anyhow::Result<OptionId>;

	async fn bind_option(&self, id: OptionId, reward_id: &RewardId) -> anyhow::Result<()>;

	async fn option_by_reward(&self, reward_id: &RewardId) -> anyhow::Result<Option<ChoiceOption>>;

	/// Adds `votes` to the option bound to `reward_id`. False when none is bound.
	async fn add_option_votes(&self, reward_id: &RewardId, votes: u32) -> anyhow::Result<bool>;

	/// Adds one vote to the option named `name` (case-insensitive), creating it
	/// first if needed. Returns the option's new vote count.
	async fn add_open_entry_vote(&self, choice_id: ChoiceId, name: &str) -> anyhow::Result<u32>;
}

/// Open the store selected by `database_url`.
pub async fn connect(database_url: &str) -> anyhow::Result<Arc<dyn Store>> {
	if database_url.trim() == MEMORY_DATABASE_URL {
		info!("using in-memory store; nothing survives a restart");
		return Ok(Arc::new(MemoryStore::default()));
	}

	let store = SqlStore::connect(database_url).await?;
	Ok(Arc::new(store))
}

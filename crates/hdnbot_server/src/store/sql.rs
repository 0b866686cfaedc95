#![forbid(unsafe_code)]

use std::collections::HashMap;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use hdnbot_domain::{
	Choice, ChoiceId, ChoiceOption, Incentive, IncentiveId, OptionId, RewardBinding, RewardId, TokenKind,
};
use hdnbot_platform::SecretString;
use tracing::trace;

use super::{NewChoice, NewIncentive, Store, StoredToken};

/// Store backed by sqlite or mysql/mariadb.
#[derive(Clone)]
pub struct SqlStore {
	backend: SqlBackend,
}

#[derive(Clone)]
enum SqlBackend {
	Sqlite(sqlx::SqlitePool),
	Mysql(sqlx::MySqlPool),
}

/// Runs `$body` against whichever pool is configured. Only for statements
/// whose SQL is identical on both backends.
macro_rules! with_pool {
	($backend:expr, |$pool:ident| $body:expr) => {
		match $backend {
			SqlBackend::Sqlite($pool) => $body,
			SqlBackend::Mysql($pool) => $body,
		}
	};
}

const INCENTIVE_COLUMNS: &str = "id, name, description, reward_id, current_votes, max_votes, is_closed";
const CHOICE_COLUMNS: &str = "id, name, description, has_open_entry, reward_id, is_closed";
const OPTION_COLUMNS: &str = "id, choice_id, name, reward_id, votes";

#[derive(Debug, sqlx::FromRow)]
struct TokenRow {
	access_token: String,
	refresh_token: Option<String>,
	expires_at: Option<i64>,
}

#[derive(Debug, sqlx::FromRow)]
struct IncentiveRow {
	id: i64,
	name: String,
	description: String,
	reward_id: String,
	current_votes: i64,
	max_votes: i64,
	is_closed: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct ChoiceRow {
	id: i64,
	name: String,
	description: String,
	has_open_entry: bool,
	reward_id: String,
	is_closed: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct OptionRow {
	id: i64,
	choice_id: i64,
	name: String,
	reward_id: String,
	votes: i64,
}

fn votes_from_column(v: i64) -> u32 {
	v.clamp(0, i64::from(u32::MAX)) as u32
}

impl From<TokenRow> for StoredToken {
	fn from(row: TokenRow) -> Self {
		Self {
			access_token: SecretString::new(row.access_token),
			refresh_token: row.refresh_token.filter(|s| !s.trim().is_empty()).map(SecretString::new),
			expires_at: row.expires_at,
		}
	}
}

impl From<IncentiveRow> for Incentive {
	fn from(row: IncentiveRow) -> Self {
		Self {
			id: IncentiveId(row.id),
			name: row.name,
			description: row.description,
			reward: RewardBinding::from_column(&row.reward_id),
			current_votes: votes_from_column(row.current_votes),
			max_votes: votes_from_column(row.max_votes),
			is_closed: row.is_closed,
		}
	}
}

impl From<OptionRow> for ChoiceOption {
	fn from(row: OptionRow) -> Self {
		Self {
			id: OptionId(row.id),
			choice_id: ChoiceId(row.choice_id),
			name: row.name,
			reward: RewardBinding::from_column(&row.reward_id),
			votes: votes_from_column(row.votes),
		}
	}
}

impl ChoiceRow {
	fn into_choice(self, options: Vec<ChoiceOption>) -> Choice {
		Choice {
			id: ChoiceId(self.id),
			name: self.name,
			description: self.description,
			has_open_entry: self.has_open_entry,
			reward: RewardBinding::from_column(&self.reward_id),
			is_closed: self.is_closed,
			options,
		}
	}
}

impl SqlStore {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			let pool = sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?;
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;

			Ok(Self {
				backend: SqlBackend::Sqlite(pool),
			})
		} else if database_url.starts_with("mysql:") || database_url.starts_with("mariadb:") {
			let pool = sqlx::MySqlPool::connect(database_url).await.context("connect mysql")?;
			sqlx::migrate!("migrations/mysql")
				.run(&pool)
				.await
				.context("run mysql migrations")?;

			Ok(Self {
				backend: SqlBackend::Mysql(pool),
			})
		} else {
			Err(anyhow!("unsupported database_url (use sqlite:, mysql:, mariadb: or memory:)"))
		}
	}

	async fn options_of(&self, choice_id: Option<ChoiceId>) -> anyhow::Result<Vec<ChoiceOption>> {
		let rows: Vec<OptionRow> = match choice_id {
			Some(id) => with_pool!(&self.backend, |pool| {
				sqlx::query_as(&format!(
					"SELECT {OPTION_COLUMNS} FROM choice_options WHERE choice_id = ? ORDER BY id"
				))
				.bind(id.0)
				.fetch_all(pool)
				.await
				.context("select choice options")?
			}),
			None => with_pool!(&self.backend, |pool| {
				sqlx::query_as(&format!("SELECT {OPTION_COLUMNS} FROM choice_options ORDER BY id"))
					.fetch_all(pool)
					.await
					.context("select all choice options")?
			}),
		};
		Ok(rows.into_iter().map(ChoiceOption::from).collect())
	}
}

#[async_trait]
impl Store for SqlStore {
	async fn load_token(&self, kind: TokenKind) -> anyhow::Result<Option<StoredToken>> {
		let row: Option<TokenRow> = with_pool!(&self.backend, |pool| {
			sqlx::query_as("SELECT access_token, refresh_token, expires_at FROM tokens WHERE kind = ?")
				.bind(kind.as_str())
				.fetch_optional(pool)
				.await
				.with_context(|| format!("select {kind} token"))?
		});
		Ok(row.map(StoredToken::from))
	}

	async fn save_token(&self, kind: TokenKind, token: &StoredToken) -> anyhow::Result<()> {
		let refresh = token.refresh_token.as_ref().map(|t| t.expose());
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO tokens (kind, access_token, refresh_token, expires_at) VALUES (?, ?, ?, ?) \
					ON CONFLICT(kind) DO UPDATE SET access_token = excluded.access_token, \
					refresh_token = excluded.refresh_token, expires_at = excluded.expires_at",
				)
				.bind(kind.as_str())
				.bind(token.access_token.expose())
				.bind(refresh)
				.bind(token.expires_at)
				.execute(pool)
				.await
				.context("upsert token (sqlite)")?;
			}
			SqlBackend::Mysql(pool) => {
				sqlx::query(
					"INSERT INTO tokens (kind, access_token, refresh_token, expires_at) VALUES (?, ?, ?, ?) \
					ON DUPLICATE KEY UPDATE access_token = VALUES(access_token), \
					refresh_token = VALUES(refresh_token), expires_at = VALUES(expires_at)",
				)
				.bind(kind.as_str())
				.bind(token.access_token.expose())
				.bind(refresh)
				.bind(token.expires_at)
				.execute(pool)
				.await
				.context("upsert token (mysql)")?;
			}
		}
		Ok(())
	}

	async fn is_admin(&self, user_id: &str) -> anyhow::Result<bool> {
		let row: Option<(String,)> = with_pool!(&self.backend, |pool| {
			sqlx::query_as("SELECT id FROM admins WHERE id = ?")
				.bind(user_id)
				.fetch_optional(pool)
				.await
				.context("select admin")?
		});
		Ok(row.is_some())
	}

	async fn add_admin(&self, user_id: &str) -> anyhow::Result<()> {
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query("INSERT OR IGNORE INTO admins (id) VALUES (?)")
					.bind(user_id)
					.execute(pool)
					.await
					.context("insert admin (sqlite)")?;
			}
			SqlBackend::Mysql(pool) => {
				sqlx::query("INSERT IGNORE INTO admins (id) VALUES (?)")
					.bind(user_id)
					.execute(pool)
					.await
					.context("insert admin (mysql)")?;
			}
		}
		Ok(())
	}

	async fn incentives(&self) -> anyhow::Result<Vec<Incentive>> {
		let rows: Vec<IncentiveRow> = with_pool!(&self.backend, |pool| {
			sqlx::query_as(&format!("SELECT {INCENTIVE_COLUMNS} FROM incentives ORDER BY id"))
				.fetch_all(pool)
				.await
				.context("select incentives")?
		});
		Ok(rows.into_iter().map(Incentive::from).collect())
	}

	async fn incentive(&self, id: IncentiveId) -> anyhow::Result<Option<Incentive>> {
		let row: Option<IncentiveRow> = with_pool!(&self.backend, |pool| {
			sqlx::query_as(&format!("SELECT {INCENTIVE_COLUMNS} FROM incentives WHERE id = ?"))
				.bind(id.0)
				.fetch_optional(pool)
				.await
				.context("select incentive")?
		});
		Ok(row.map(Incentive::from))
	}

	async fn incentive_by_reward(&self, reward_id: &RewardId) -> anyhow::Result<Option<Incentive>> {
		let row: Option<IncentiveRow> = with_pool!(&self.backend, |pool| {
			sqlx::query_as(&format!(
				"SELECT {INCENTIVE_COLUMNS} FROM incentives WHERE reward_id = ? ORDER BY id LIMIT 1"
			))
			.bind(reward_id.as_str())
			.fetch_optional(pool)
			.await
			.context("select incentive by reward")?
		});
		Ok(row.map(Incentive::from))
	}

	async fn insert_incentive(&self, incentive: NewIncentive<'_>) -> anyhow::Result<IncentiveId> {
		const SQL: &str = "INSERT INTO incentives (name, description, reward_id, current_votes, max_votes, is_closed) \
			VALUES (?, ?, '0', 0, ?, FALSE)";
		let id = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query(SQL)
				.bind(incentive.name)
				.bind(incentive.description)
				.bind(i64::from(incentive.max_votes))
				.execute(pool)
				.await
				.context("insert incentive (sqlite)")?
				.last_insert_rowid(),
			SqlBackend::Mysql(pool) => sqlx::query(SQL)
				.bind(incentive.name)
				.bind(incentive.description)
				.bind(i64::from(incentive.max_votes))
				.execute(pool)
				.await
				.context("insert incentive (mysql)")?
				.last_insert_id() as i64,
		};
		Ok(IncentiveId(id))
	}

	async fn bind_incentive(&self, id: IncentiveId, reward_id: &RewardId) -> anyhow::Result<()> {
		let affected = with_pool!(&self.backend, |pool| {
			sqlx::query("UPDATE incentives SET reward_id = ? WHERE id = ?")
				.bind(reward_id.as_str())
				.bind(id.0)
				.execute(pool)
				.await
				.context("bind incentive reward")?
				.rows_affected()
		});
		trace!(incentive_id = id.0, affected, "bind incentive reward");
		Ok(())
	}

	async fn add_incentive_votes(&self, reward_id: &RewardId, votes: u32) -> anyhow::Result<bool> {
		let affected = with_pool!(&self.backend, |pool| {
			sqlx::query("UPDATE incentives SET current_votes = current_votes + ? WHERE reward_id = ?")
				.bind(i64::from(votes))
				.bind(reward_id.as_str())
				.execute(pool)
				.await
				.context("add incentive votes")?
				.rows_affected()
		});
		Ok(affected > 0)
	}

	async fn set_incentive_closed(&self, id: IncentiveId, closed: bool) -> anyhow::Result<()> {
		let affected = with_pool!(&self.backend, |pool| {
			sqlx::query("UPDATE incentives SET is_closed = ? WHERE id = ?")
				.bind(closed)
				.bind(id.0)
				.execute(pool)
				.await
				.context("set incentive closed")?
				.rows_affected()
		});
		trace!(incentive_id = id.0, affected, "set incentive closed");
		Ok(())
	}

	async fn delete_incentive(&self, id: IncentiveId) -> anyhow::Result<bool> {
		let affected = with_pool!(&self.backend, |pool| {
			sqlx::query("DELETE FROM incentives WHERE id = ?")
				.bind(id.0)
				.execute(pool)
				.await
				.context("delete incentive")?
				.rows_affected()
		});
		Ok(affected > 0)
	}

	async fn choices(&self) -> anyhow::Result<Vec<Choice>> {
		let rows: Vec<ChoiceRow> = with_pool!(&self.backend, |pool| {
			sqlx::query_as(&format!("SELECT {CHOICE_COLUMNS} FROM choices ORDER BY id"))
				.fetch_all(pool)
				.await
				.context("select choices")?
		});

		let mut options_by_choice: HashMap<ChoiceId, Vec<ChoiceOption>> = HashMap::new();
		for option in self.options_of(None).await? {
			options_by_choice.entry(option.choice_id).or_default().push(option);
		}

		Ok(rows
			.into_iter()
			.map(|row| {
				let options = options_by_choice.remove(&ChoiceId(row.id)).unwrap_or_default();
				row.into_choice(options)
			})
			.collect())
	}

	async fn choice(&self, id: ChoiceId) -> anyhow::Result<Option<Choice>> {
		let row: Option<ChoiceRow> = with_pool!(&self.backend, |pool| {
			sqlx::query_as(&format!("SELECT {CHOICE_COLUMNS} FROM choices WHERE id = ?"))
				.bind(id.0)
				.fetch_optional(pool)
				.await
				.context("select choice")?
		});
		let Some(row) = row else {
			return Ok(None);
		};
		let options = self.options_of(Some(id)).await?;
		Ok(Some(row.into_choice(options)))
	}

	async fn choice_by_reward(&self, reward_id: &RewardId) -> anyhow::Result<Option<Choice>> {
		let row: Option<ChoiceRow> = with_pool!(&self.backend, |pool| {
			sqlx::query_as(&format!(
				"SELECT {CHOICE_COLUMNS} FROM choices WHERE has_open_entry = TRUE AND reward_id = ? ORDER BY id LIMIT 1"
			))
			.bind(reward_id.as_str())
			.fetch_optional(pool)
			.await
			.context("select choice by reward")?
		});
		let Some(row) = row else {
			return Ok(None);
		};
		let options = self.options_of(Some(ChoiceId(row.id))).await?;
		Ok(Some(row.into_choice(options)))
	}

	async fn insert_choice(&self, choice: NewChoice<'_>) -> anyhow::Result<ChoiceId> {
		const SQL: &str = "INSERT INTO choices (name, description, has_open_entry, reward_id, is_closed) \
			VALUES (?, ?, ?, '0', FALSE)";
		let id = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query(SQL)
				.bind(choice.name)
				.bind(choice.description)
				.bind(choice.has_open_entry)
				.execute(pool)
				.await
				.context("insert choice (sqlite)")?
				.last_insert_rowid(),
			SqlBackend::Mysql(pool) => sqlx::query(SQL)
				.bind(choice.name)
				.bind(choice.description)
				.bind(choice.has_open_entry)
				.execute(pool)
				.await
				.context("insert choice (mysql)")?
				.last_insert_id() as i64,
		};
		Ok(ChoiceId(id))
	}

	async fn bind_choice(&self, id: ChoiceId, reward_id: &RewardId) -> anyhow::Result<()> {
		let affected = with_pool!(&self.backend, |pool| {
			sqlx::query("UPDATE choices SET reward_id = ? WHERE id = ?")
				.bind(reward_id.as_str())
				.bind(id.0)
				.execute(pool)
				.await
				.context("bind choice reward")?
				.rows_affected()
		});
		trace!(choice_id = id.0, affected, "bind choice reward");
		Ok(())
	}

	async fn set_choice_closed(&self, id: ChoiceId, closed: bool) -> anyhow::Result<()> {
		let affected = with_pool!(&self.backend, |pool| {
			sqlx::query("UPDATE choices SET is_closed = ? WHERE id = ?")
				.bind(closed)
				.bind(id.0)
				.execute(pool)
				.await
				.context("set choice closed")?
				.rows_affected()
		});
		trace!(choice_id = id.0, affected, "set choice closed");
		Ok(())
	}

	async fn delete_choice(&self, id: ChoiceId) -> anyhow::Result<bool> {
		let affected = with_pool!(&self.backend, |pool| {
			let mut tx = pool.begin().await.context("begin delete choice tx")?;
			sqlx::query("DELETE FROM choice_options WHERE choice_id = ?")
				.bind(id.0)
				.execute(&mut *tx)
				.await
				.context("delete choice options")?;
			let affected = sqlx::query("DELETE FROM choices WHERE id = ?")
				.bind(id.0)
				.execute(&mut *tx)
				.await
				.context("delete choice")?
				.rows_affected();
			tx.commit().await.context("commit delete choice tx")?;
			affected
		});
		Ok(affected > 0)
	}

	async fn insert_option(&self, choice_id: ChoiceId, name: &str) -> anyhow::Result<OptionId> {
		const SQL: &str = "INSERT INTO choice_options (choice_id, name, reward_id, votes) VALUES (?, ?, '0', 0)";
		let id = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query(SQL)
				.bind(choice_id.0)
				.bind(name)
				.execute(pool)
				.await
				.context("insert choice option (sqlite)")?
				.last_insert_rowid(),
			SqlBackend::Mysql(pool) => sqlx::query(SQL)
				.bind(choice_id.0)
				.bind(name)
				.execute(pool)
				.await
				.context("insert choice option (mysql)")?
				.last_insert_id() as i64,
		};
		Ok(OptionId(id))
	}

	async fn bind_option(&self, id: OptionId, reward_id: &RewardId) -> anyhow::Result<()> {
		let affected = with_pool!(&self.backend, |pool| {
			sqlx::query("UPDATE choice_options SET reward_id = ? WHERE id = ?")
				.bind(reward_id.as_str())
				.bind(id.0)
				.execute(pool)
				.await
				.context("bind option reward")?
				.rows_affected()
		});
		trace!(option_id = id.0, affected, "bind option reward");
		Ok(())
	}

	async fn option_by_reward(&self, reward_id: &RewardId) -> anyhow::Result<Option<ChoiceOption>> {
		let row: Option<OptionRow> = with_pool!(&self.backend, |pool| {
			sqlx::query_as(&format!(
				"SELECT {OPTION_COLUMNS} FROM choice_options WHERE reward_id = ? ORDER BY id LIMIT 1"
			))
			.bind(reward_id.as_str())
			.fetch_optional(pool)
			.await
			.context("select option by reward")?
		});
		Ok(row.map(ChoiceOption::from))
	}

	async fn add_option_votes(&self, reward_id: &RewardId, votes: u32) -> anyhow::Result<bool> {
		let affected = with_pool!(&self.backend, |pool| {
			sqlx::query("UPDATE choice_options SET votes = votes + ? WHERE reward_id = ?")
				.bind(i64::from(votes))
				.bind(reward_id.as_str())
				.execute(pool)
				.await
				.context("add option votes")?
				.rows_affected()
		});
		Ok(affected > 0)
	}

	async fn add_open_entry_vote(&self, choice_id: ChoiceId, name: &str) -> anyhow::Result<u32> {
		const SELECT_VOTES: &str = "SELECT votes FROM choice_options WHERE choice_id = ? AND name = ?";
		let votes = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				let mut tx = pool.begin().await.context("begin sqlite tx")?;
				sqlx::query(
					"INSERT INTO choice_options (choice_id, name, reward_id, votes) VALUES (?, ?, '0', 1) \
					ON CONFLICT(choice_id, name) DO UPDATE SET votes = votes + 1",
				)
				.bind(choice_id.0)
				.bind(name)
				.execute(&mut *tx)
				.await
				.context("upsert open entry vote (sqlite)")?;
				let (votes,): (i64,) = sqlx::query_as(SELECT_VOTES)
					.bind(choice_id.0)
					.bind(name)
					.fetch_one(&mut *tx)
					.await
					.context("select open entry votes (sqlite)")?;
				tx.commit().await.context("commit sqlite tx")?;
				votes
			}
			SqlBackend::Mysql(pool) => {
				let mut tx = pool.begin().await.context("begin mysql tx")?;
				sqlx::query(
					"INSERT INTO choice_options (choice_id, name, reward_id, votes) VALUES (?, ?, '0', 1) \
					ON DUPLICATE KEY UPDATE votes = votes + 1",
				)
				.bind(choice_id.0)
				.bind(name)
				.execute(&mut *tx)
				.await
				.context("upsert open entry vote (mysql)")?;
				let (votes,): (i64,) = sqlx::query_as(SELECT_VOTES)
					.bind(choice_id.0)
					.bind(name)
					.fetch_one(&mut *tx)
					.await
					.context("select open entry votes (mysql)")?;
				tx.commit().await.context("commit mysql tx")?;
				votes
			}
		};
		Ok(votes_from_column(votes))
	}
}

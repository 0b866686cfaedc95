#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Context;
use hdnbot_platform::UserDirectory;
use parking_lot::RwLock;
use tracing::info;

/// The channel the bot serves. The numeric id is looked up once and cached.
pub struct BroadcasterIdentity {
	login: String,
	id: RwLock<Option<String>>,
	users: Arc<dyn UserDirectory>,
}

impl BroadcasterIdentity {
	pub fn new(login: impl Into<String>, override_id: Option<String>, users: Arc<dyn UserDirectory>) -> Self {
		Self {
			login: login.into(),
			id: RwLock::new(override_id.filter(|s| !s.trim().is_empty())),
			users,
		}
	}

	pub fn login(&self) -> &str {
		&self.login
	}

	pub async fn id(&self) -> anyhow::Result<String> {
		if let Some(id) = self.id.read().clone() {
			return Ok(id);
		}

		let user = self
			.users
			.user_by_login(&self.login)
			.await
			.with_context(|| format!("look up broadcaster {}", self.login))?
			.with_context(|| format!("broadcaster {} does not exist", self.login))?;

		info!(login = %self.login, broadcaster_id = %user.id, "resolved broadcaster id");
		*self.id.write() = Some(user.id.clone());
		Ok(user.id)
	}
}

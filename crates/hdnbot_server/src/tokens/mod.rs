#![forbid(unsafe_code)]

//! Token lifecycle: validation, refresh and per-kind capability.
//!
//! Each [`TokenKind`] has a capability published on a `watch` channel. Only a
//! `Granted` token is handed out through [`TokenSource`]; `Unknown` (the last
//! validation could not reach Twitch) is treated like `Denied` by every caller.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Context;
use hdnbot_domain::TokenKind;
use hdnbot_platform::{OAuthEndpoint, PlatformError, SecretString, TokenGrant, TokenSource, TokenValidation};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::store::{Store, StoredToken};
use crate::util::timer::TimerSlot;
use crate::util::unix_now_secs;


/// Whether a token of a kind may be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
	/// The last validation could not complete.
	Unknown,
	Granted,
	Denied,
}

impl Capability {
	pub fn is_granted(self) -> bool {
		matches!(self, Capability::Granted)
	}
}

#[derive(Debug, Clone)]
struct TokenState {
	access_token: Option<SecretString>,
	refresh_token: Option<SecretString>,
	expires_at: Option<i64>,
	user_id: Option<String>,
	login: Option<String>,
}

impl TokenState {
	fn from_stored(stored: StoredToken) -> Self {
		Self {
			access_token: Some(stored.access_token).filter(|t| !t.is_blank()),
			refresh_token: stored.refresh_token.filter(|t| !t.is_blank()),
			expires_at: stored.expires_at,
			user_id: None,
			login: None,
		}
	}

	fn to_stored(&self) -> Option<StoredToken> {
		Some(StoredToken {
			access_token: self.access_token.clone()?,
			refresh_token: self.refresh_token.clone(),
			expires_at: self.expires_at,
		})
	}
}

struct Slot {
	token: Option<TokenState>,
	refresh_timer: TimerSlot,
}

/// Refresh tokens used when the store has nothing for a kind yet.
#[derive(Debug, Clone, Default)]
pub struct TokenSeeds {
	pub chat_refresh_token: Option<SecretString>,
	pub broadcaster_refresh_token: Option<SecretString>,
}

impl TokenSeeds {
	fn get(&self, kind: TokenKind) -> Option<&SecretString> {
		match kind {
			TokenKind::Chat => self.chat_refresh_token.as_ref(),
			TokenKind::Broadcaster => self.broadcaster_refresh_token.as_ref(),
		}
		.filter(|t| !t.is_blank())
	}
}

pub struct TokenManager {
	me: Weak<TokenManager>,
	oauth: Arc<dyn OAuthEndpoint>,
	store: Arc<dyn Store>,
	seeds: TokenSeeds,
	slots: Mutex<HashMap<TokenKind, Slot>>,
	capabilities: HashMap<TokenKind, watch::Sender<Capability>>,
	refresh_gates: HashMap<TokenKind, tokio::sync::Mutex<()>>,
}

/// Refresh fires slightly before the reported expiry.
fn refresh_delay(expires_in_secs: u64) -> Duration {
	Duration::from_millis(expires_in_secs.saturating_mul(999))
}

impl TokenManager {
	pub fn new(oauth: Arc<dyn OAuthEndpoint>, store: Arc<dyn Store>, seeds: TokenSeeds) -> Arc<Self> {
		Arc::new_cyclic(|me| Self {
			me: me.clone(),
			oauth,
			store,
			seeds,
			slots: Mutex::new(
				TokenKind::ALL
					.into_iter()
					.map(|kind| {
						(
							kind,
							Slot {
								token: None,
								refresh_timer: TimerSlot::new(),
							},
						)
					})
					.collect(),
			),
			capabilities: TokenKind::ALL
				.into_iter()
				.map(|kind| (kind, watch::channel(Capability::Denied).0))
				.collect(),
			refresh_gates: TokenKind::ALL
				.into_iter()
				.map(|kind| (kind, tokio::sync::Mutex::new(())))
				.collect(),
		})
	}

	pub fn capability(&self, kind: TokenKind) -> Capability {
		self.capabilities
			.get(&kind)
			.map(|tx| *tx.borrow())
			.unwrap_or(Capability::Denied)
	}

	pub fn has_capability(&self, kind: TokenKind) -> bool {
		self.capability(kind).is_granted()
	}

	/// Watch capability changes of `kind`.
	pub fn subscribe(&self, kind: TokenKind) -> Option<watch::Receiver<Capability>> {
		self.capabilities.get(&kind).map(|tx| tx.subscribe())
	}

	/// Login of the user the `kind` token belongs to, once validated.
	pub fn login(&self, kind: TokenKind) -> Option<String> {
		self.slots
			.lock()
			.get(&kind)
			.and_then(|s| s.token.as_ref())
			.and_then(|t| t.login.clone())
	}

	pub fn refresh_pending(&self, kind: TokenKind) -> bool {
		self.slots
			.lock()
			.get(&kind)
			.is_some_and(|s| s.refresh_timer.is_pending())
	}

	fn set_capability(&self, kind: TokenKind, capability: Capability) {
		let Some(tx) = self.capabilities.get(&kind) else {
			return;
		};
		let previous = tx.send_replace(capability);
		if previous != capability {
			info!(%kind, ?previous, current = ?capability, "token capability changed");
			metrics::counter!("hdnbot_token_capability_changes_total", "kind" => kind.as_str()).increment(1);
		}
	}

	fn current_access(&self, kind: TokenKind) -> Option<SecretString> {
		self.slots
			.lock()
			.get(&kind)
			.and_then(|s| s.token.as_ref())
			.and_then(|t| t.access_token.clone())
	}

	fn current_refresh(&self, kind: TokenKind) -> Option<SecretString> {
		self.slots
			.lock()
			.get(&kind)
			.and_then(|s| s.token.as_ref())
			.and_then(|t| t.refresh_token.clone())
	}

	/// Cancel any pending refresh for `kind`; arm a new one unless `expires_in` is zero.
	fn rearm_refresh(&self, kind: TokenKind, expires_in: u64) {
		let mut slots = self.slots.lock();
		let Some(slot) = slots.get_mut(&kind) else {
			return;
		};

		if expires_in == 0 {
			slot.refresh_timer.cancel();
			debug!(%kind, "token does not expire; no refresh scheduled");
			return;
		}

		let delay = refresh_delay(expires_in);
		let me = self.me.clone();
		slot.refresh_timer.arm(delay, async move {
			let Some(manager) = me.upgrade() else {
				return;
			};
			tokio::spawn(async move {
				manager.refresh(kind).await;
			});
		});
		debug!(%kind, delay_secs = delay.as_secs(), "token refresh scheduled");
	}

	/// Load persisted tokens; kinds with nothing stored fall back to seed refresh tokens.
	pub async fn load(&self) -> anyhow::Result<()> {
		for kind in TokenKind::ALL {
			let stored = self
				.store
				.load_token(kind)
				.await
				.with_context(|| format!("load {kind} token"))?;

			let state = match stored {
				Some(stored) => Some(TokenState::from_stored(stored)),
				None => self.seeds.get(kind).map(|seed| TokenState {
					access_token: None,
					refresh_token: Some(seed.clone()),
					expires_at: None,
					user_id: None,
					login: None,
				}),
			};

			match &state {
				Some(_) => debug!(%kind, "token loaded"),
				None => warn!(%kind, "no token stored or configured"),
			}

			if let Some(slot) = self.slots.lock().get_mut(&kind) {
				slot.token = state;
			}
		}
		Ok(())
	}

	/// Load tokens and bring each kind to a known capability.
	pub async fn initialize(&self) -> anyhow::Result<()> {
		self.load().await?;
		for kind in TokenKind::ALL {
			self.ensure(kind).await;
		}
		Ok(())
	}

	/// Validate if an access token exists, otherwise try a refresh.
	pub async fn ensure(&self, kind: TokenKind) -> Capability {
		if self.current_access(kind).is_some() {
			self.validate(kind).await
		} else if self.current_refresh(kind).is_some() {
			self.refresh(kind).await
		} else {
			warn!(%kind, "no usable token; running without it");
			self.set_capability(kind, Capability::Denied);
			Capability::Denied
		}
	}

	/// Introspect the current token of `kind`.
	///
	/// A structured rejection triggers exactly one refresh attempt. Failing to
	/// reach Twitch leaves the capability `Unknown`.
	pub async fn validate(&self, kind: TokenKind) -> Capability {
		let Some(access) = self.current_access(kind) else {
			warn!(%kind, "no token to validate; running without it");
			self.set_capability(kind, Capability::Denied);
			return Capability::Denied;
		};

		match self.oauth.validate(&access).await {
			Ok(validation) => {
				let missing = kind.missing_scopes(&validation.scopes);
				if let Some(slot) = self.slots.lock().get_mut(&kind)
					&& let Some(token) = slot.token.as_mut()
				{
					token.user_id = validation.user_id.clone();
					token.login = validation.login.clone();
					if validation.expires_in > 0 {
						token.expires_at = Some(unix_now_secs() + validation.expires_in as i64);
					}
				}
				self.rearm_refresh(kind, validation.expires_in);

				let capability = if missing.is_empty() {
					info!(
						%kind,
						login = validation.login.as_deref().unwrap_or("-"),
						expires_in = validation.expires_in,
						"token validated"
					);
					Capability::Granted
				} else {
					warn!(%kind, ?missing, granted = ?validation.scopes, "token lacks required scopes");
					Capability::Denied
				};
				self.set_capability(kind, capability);
				capability
			}
			Err(e @ PlatformError::Unauthorized { .. }) => {
				warn!(%kind, error = %e, "token rejected; attempting refresh");
				self.set_capability(kind, Capability::Denied);
				self.refresh(kind).await
			}
			Err(e) => {
				error!(%kind, error = %e, "token validation did not complete");
				metrics::counter!("hdnbot_token_validation_errors_total", "kind" => kind.as_str()).increment(1);
				self.set_capability(kind, Capability::Unknown);
				Capability::Unknown
			}
		}
	}

	/// Exchange the refresh token of `kind` for a new pair.
	pub async fn refresh(&self, kind: TokenKind) -> Capability {
		let Some(gate) = self.refresh_gates.get(&kind) else {
			return Capability::Denied;
		};
		let _gate = gate.lock().await;

		let Some(refresh_token) = self.current_refresh(kind) else {
			warn!(%kind, "no refresh token; running without this token");
			self.set_capability(kind, Capability::Denied);
			return Capability::Denied;
		};

		metrics::counter!("hdnbot_token_refresh_total", "kind" => kind.as_str()).increment(1);
		match self.oauth.refresh(&refresh_token).await {
			Ok(grant) => self.install_grant(kind, grant, Some(refresh_token), None).await,
			Err(e) => {
				error!(%kind, error = %e, "token refresh failed; running without this token");
				metrics::counter!("hdnbot_token_refresh_failures_total", "kind" => kind.as_str()).increment(1);
				self.set_capability(kind, Capability::Denied);
				Capability::Denied
			}
		}
	}

	/// Complete an authorization-code grant for `kind`.
	///
	/// With `expected_login` set, a token belonging to any other account is rejected.
	pub async fn exchange_code(
		&self,
		kind: TokenKind,
		code: &str,
		redirect_uri: &str,
		expected_login: Option<&str>,
	) -> anyhow::Result<Capability> {
		let grant = self
			.oauth
			.exchange_code(code, redirect_uri)
			.await
			.with_context(|| format!("exchange authorization code for {kind} token"))?;

		let validation = self
			.oauth
			.validate(&grant.access_token)
			.await
			.with_context(|| format!("validate new {kind} token"))?;

		if let Some(expected) = expected_login {
			let login = validation.login.as_deref().unwrap_or_default();
			if !login.eq_ignore_ascii_case(expected) {
				anyhow::bail!("{kind} token belongs to {login:?}, expected {expected:?}");
			}
		}

		let _gate = match self.refresh_gates.get(&kind) {
			Some(gate) => Some(gate.lock().await),
			None => None,
		};
		Ok(self.install_grant(kind, grant, None, Some(validation)).await)
	}

	async fn install_grant(
		&self,
		kind: TokenKind,
		grant: TokenGrant,
		previous_refresh: Option<SecretString>,
		owner: Option<TokenValidation>,
	) -> Capability {
		let refresh_token = grant.refresh_token.clone().filter(|t| !t.is_blank()).or(previous_refresh);
		let expires_at = (grant.expires_in > 0).then(|| unix_now_secs() + grant.expires_in as i64);

		let (user_id, login) = match owner {
			Some(v) => (v.user_id, v.login),
			None => {
				let previous = self.slots.lock().get(&kind).and_then(|s| s.token.clone());
				(
					previous.as_ref().and_then(|p| p.user_id.clone()),
					previous.and_then(|p| p.login),
				)
			}
		};
		let state = TokenState {
			access_token: Some(grant.access_token.clone()),
			refresh_token,
			expires_at,
			user_id,
			login,
		};

		if let Some(stored) = state.to_stored()
			&& let Err(e) = self.store.save_token(kind, &stored).await
		{
			error!(%kind, error = ?e, "failed to persist token; keeping it in memory only");
		}

		if let Some(slot) = self.slots.lock().get_mut(&kind) {
			slot.token = Some(state);
		}
		self.rearm_refresh(kind, grant.expires_in);

		// A grant without a scope list keeps the scopes it was first issued with.
		let missing = kind.missing_scopes(&grant.scope);
		let capability = if grant.scope.is_empty() || missing.is_empty() {
			info!(%kind, expires_in = grant.expires_in, "token refreshed");
			Capability::Granted
		} else {
			warn!(%kind, ?missing, "refreshed token lacks required scopes");
			Capability::Denied
		};
		self.set_capability(kind, capability);
		capability
	}

	/// Cancel pending refreshes.
	pub fn shutdown(&self) {
		for slot in self.slots.lock().values_mut() {
			slot.refresh_timer.cancel();
		}
	}
}

impl TokenSource for TokenManager {
	fn access_token(&self, kind: TokenKind) -> Option<SecretString> {
		if !self.has_capability(kind) {
			return None;
		}
		self.current_access(kind)
	}

	fn user_id(&self, kind: TokenKind) -> Option<String> {
		self.slots
			.lock()
			.get(&kind)
			.and_then(|s| s.token.as_ref())
			.and_then(|t| t.user_id.clone())
	}
}

#![forbid(unsafe_code)]

pub mod twitch;

use std::fmt;

use async_trait::async_trait;
use hdnbot_domain::{NewReward, RemoteReward, RewardId, TokenKind};
use serde::Deserialize;
use thiserror::Error;

/// Wrapper that redacts in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}

	pub fn is_blank(&self) -> bool {
		self.0.trim().is_empty()
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

impl<'de> serde::Deserialize<'de> for SecretString {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Ok(SecretString::new(s))
	}
}

/// Classified failure of a Twitch call.
///
/// `Unauthorized` is a structured rejection of the credentials; `Network` means no
/// response was received at all. Callers branch on the two differently.
#[derive(Debug, Error)]
pub enum PlatformError {
	#[error("{op}: network error: {message}")]
	Network { op: &'static str, message: String },

	#[error("{op}: unauthorized (status={status}) body={body}")]
	Unauthorized { op: &'static str, status: u16, body: String },

	#[error("{op}: failed (status={status}) body={body}")]
	Api { op: &'static str, status: u16, body: String },

	#[error("{op}: decode failed: {message}")]
	Decode { op: &'static str, message: String },

	#[error("{op}: invalid request: {message}")]
	InvalidRequest { op: &'static str, message: String },

	#[error("no usable {0} token")]
	MissingCredentials(TokenKind),
}

impl PlatformError {
	pub(crate) fn network(op: &'static str, err: &reqwest::Error) -> Self {
		Self::Network {
			op,
			message: err.to_string(),
		}
	}

	pub(crate) fn decode(op: &'static str, err: &serde_json::Error) -> Self {
		Self::Decode {
			op,
			message: err.to_string(),
		}
	}

	/// Credentials were rejected or are not available.
	pub fn is_auth(&self) -> bool {
		matches!(self, Self::Unauthorized { .. } | Self::MissingCredentials(_))
	}

	pub fn is_network(&self) -> bool {
		matches!(self, Self::Network { .. })
	}

	pub fn is_not_found(&self) -> bool {
		matches!(self, Self::Api { status: 404, .. })
	}

	pub fn status(&self) -> Option<u16> {
		match self {
			Self::Unauthorized { status, .. } | Self::Api { status, .. } => Some(*status),
			_ => None,
		}
	}
}

/// Result of the OAuth introspection endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenValidation {
	pub client_id: String,
	#[serde(default)]
	pub login: Option<String>,
	#[serde(default)]
	pub user_id: Option<String>,
	/// Seconds until expiry; zero for tokens that never expire.
	#[serde(default)]
	pub expires_in: u64,
	#[serde(default)]
	pub scopes: Vec<String>,
}

/// Result of a refresh-token or authorization-code grant.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenGrant {
	pub access_token: SecretString,
	#[serde(default)]
	pub refresh_token: Option<SecretString>,
	#[serde(default)]
	pub expires_in: u64,
	#[serde(default)]
	pub scope: Vec<String>,
}

/// A Twitch user as returned by the users endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TwitchUser {
	pub id: String,
	pub login: String,
	pub display_name: String,
}

/// Current credentials, as seen by API clients.
///
/// Implementations only hand out tokens that are currently usable.
pub trait TokenSource: Send + Sync {
	fn access_token(&self, kind: TokenKind) -> Option<SecretString>;

	/// Twitch user id the token of `kind` belongs to.
	fn user_id(&self, kind: TokenKind) -> Option<String>;
}

/// Token introspection and grant endpoints.
#[async_trait]
pub trait OAuthEndpoint: Send + Sync {
	async fn validate(&self, access_token: &SecretString) -> Result<TokenValidation, PlatformError>;

	async fn refresh(&self, refresh_token: &SecretString) -> Result<TokenGrant, PlatformError>;

	async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<TokenGrant, PlatformError>;
}

/// Channel-points reward catalog of one broadcaster.
#[async_trait]
pub trait RewardCatalog: Send + Sync {
	async fn list_rewards(&self, broadcaster_id: &str) -> Result<Vec<RemoteReward>, PlatformError>;

	async fn create_reward(&self, broadcaster_id: &str, reward: &NewReward) -> Result<RemoteReward, PlatformError>;

	async fn set_reward_paused(
		&self,
		broadcaster_id: &str,
		reward_id: &RewardId,
		paused: bool,
	) -> Result<(), PlatformError>;

	async fn delete_reward(&self, broadcaster_id: &str, reward_id: &RewardId) -> Result<(), PlatformError>;
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
	async fn user_by_login(&self, login: &str) -> Result<Option<TwitchUser>, PlatformError>;
}

/// Sends chat messages into a channel as the chat-token user.
#[async_trait]
pub trait ChatSink: Send + Sync {
	async fn send_chat(&self, broadcaster_id: &str, text: &str) -> Result<(), PlatformError>;
}

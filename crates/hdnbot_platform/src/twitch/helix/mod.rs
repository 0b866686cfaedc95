#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hdnbot_domain::{NewReward, RemoteReward, RewardId, TokenKind};
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::{ChatSink, PlatformError, RewardCatalog, TokenSource, TwitchUser, UserDirectory};

const CUSTOM_REWARDS_PATH: &str = "/helix/channel_points/custom_rewards";
const CHAT_MESSAGES_PATH: &str = "/helix/chat/messages";
const USERS_PATH: &str = "/helix/users";

fn retry_delay_from_headers(headers: &HeaderMap) -> Option<Duration> {
	if let Some(v) = headers.get(RETRY_AFTER)
		&& let Ok(s) = v.to_str()
		&& let Ok(secs) = s.trim().parse::<u64>()
	{
		return Some(Duration::from_secs(secs));
	}

	if let Some(v) = headers.get("Ratelimit-Reset")
		&& let Ok(s) = v.to_str()
		&& let Ok(reset_unix) = s.trim().parse::<u64>()
	{
		let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_secs();
		if reset_unix > now {
			return Some(Duration::from_secs(reset_unix - now));
		}
	}

	None
}

async fn send_with_retry(req: reqwest::RequestBuilder, op: &'static str) -> Result<reqwest::Response, PlatformError> {
	let retry_builder = req.try_clone();
	let resp = req.send().await.map_err(|e| PlatformError::network(op, &e))?;
	let status = resp.status();

	if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
		let body = resp.text().await.unwrap_or_default();
		return Err(PlatformError::Unauthorized {
			op,
			status: status.as_u16(),
			body,
		});
	}

	if status == StatusCode::TOO_MANY_REQUESTS
		&& let Some(delay) = retry_delay_from_headers(resp.headers())
		&& let Some(retry) = retry_builder
	{
		metrics::counter!("hdnbot_helix_retries_total", "reason" => "rate_limit").increment(1);
		debug!(op, delay_ms = delay.as_millis() as u64, "helix rate limited; retrying once");
		tokio::time::sleep(delay).await;
		return retry.send().await.map_err(|e| PlatformError::network(op, &e));
	}

	if status.is_server_error()
		&& let Some(retry) = retry_builder
	{
		metrics::counter!("hdnbot_helix_retries_total", "reason" => "server_error").increment(1);
		tokio::time::sleep(Duration::from_millis(250)).await;
		return retry.send().await.map_err(|e| PlatformError::network(op, &e));
	}

	Ok(resp)
}

/// Read the body of a response, failing on non-success statuses.
async fn success_body(resp: reqwest::Response, op: &'static str) -> Result<String, PlatformError> {
	let status = resp.status();
	let body = resp.text().await.map_err(|e| PlatformError::network(op, &e))?;
	if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
		return Err(PlatformError::Unauthorized {
			op,
			status: status.as_u16(),
			body,
		});
	}
	if !status.is_success() {
		return Err(PlatformError::Api {
			op,
			status: status.as_u16(),
			body,
		});
	}
	Ok(body)
}

fn parse_json<T: DeserializeOwned>(body: &str, op: &'static str) -> Result<T, PlatformError> {
	serde_json::from_str(body).map_err(|e| PlatformError::decode(op, &e))
}

#[derive(Debug, Deserialize)]
struct HelixDataResponse<T> {
	data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct HelixCustomReward {
	id: String,
	title: String,
	#[serde(default)]
	prompt: String,
	cost: u32,
	#[serde(default)]
	is_paused: bool,
	#[serde(default = "default_enabled")]
	is_enabled: bool,
	#[serde(default)]
	is_user_input_required: bool,
}

fn default_enabled() -> bool {
	true
}

impl HelixCustomReward {
	fn into_remote(self, op: &'static str) -> Result<RemoteReward, PlatformError> {
		let id = RewardId::new(self.id).map_err(|e| PlatformError::Decode {
			op,
			message: format!("reward id: {e}"),
		})?;
		Ok(RemoteReward {
			id,
			title: self.title,
			prompt: self.prompt,
			cost: self.cost,
			is_paused: self.is_paused,
			is_enabled: self.is_enabled,
			is_user_input_required: self.is_user_input_required,
		})
	}
}

pub(crate) fn parse_rewards(body: &str, op: &'static str) -> Result<Vec<RemoteReward>, PlatformError> {
	let parsed: HelixDataResponse<HelixCustomReward> = parse_json(body, op)?;
	parsed.data.into_iter().map(|r| r.into_remote(op)).collect()
}

#[derive(Debug, Serialize)]
struct HelixCreateReward<'a> {
	title: &'a str,
	prompt: &'a str,
	cost: u32,
	is_user_input_required: bool,
	should_redemptions_skip_request_queue: bool,
}

#[derive(Debug, Serialize)]
struct HelixUpdateRewardPaused {
	is_paused: bool,
}

#[derive(Debug, Serialize)]
struct HelixSendChatMessage<'a> {
	broadcaster_id: &'a str,
	sender_id: &'a str,
	message: &'a str,
}

/// Helix API client bound to the bot's live credentials.
#[derive(Clone)]
pub struct HelixClient {
	http: reqwest::Client,
	base_url: Url,
	client_id: String,
	tokens: Arc<dyn TokenSource>,
}

impl HelixClient {
	pub fn new(base_url: Url, client_id: impl Into<String>, tokens: Arc<dyn TokenSource>) -> anyhow::Result<Self> {
		let http = reqwest::Client::builder()
			.user_agent("hdnbot/0.x (helix)")
			.timeout(Duration::from_secs(30))
			.build()
			.map_err(|e| anyhow::anyhow!("build reqwest client: {e}"))?;

		Ok(Self {
			http,
			base_url,
			client_id: client_id.into(),
			tokens,
		})
	}

	fn authed(&self, req: reqwest::RequestBuilder, kind: TokenKind) -> Result<reqwest::RequestBuilder, PlatformError> {
		let token = self
			.tokens
			.access_token(kind)
			.ok_or(PlatformError::MissingCredentials(kind))?;
		Ok(req
			.header("Client-Id", &self.client_id)
			.header("Authorization", format!("Bearer {}", token.expose())))
	}

	fn url(&self, path_and_query: &str, op: &'static str) -> Result<Url, PlatformError> {
		self.base_url
			.join(path_and_query)
			.map_err(|e| PlatformError::InvalidRequest {
				op,
				message: format!("join helix url: {e}"),
			})
	}

	fn reward_url(&self, broadcaster_id: &str, reward_id: Option<&RewardId>, op: &'static str) -> Result<Url, PlatformError> {
		let mut path = format!(
			"{base}?broadcaster_id={b}",
			base = CUSTOM_REWARDS_PATH,
			b = urlencoding::encode(broadcaster_id),
		);
		if let Some(id) = reward_id {
			path.push_str("&id=");
			path.push_str(&urlencoding::encode(id.as_str()));
		}
		self.url(&path, op)
	}

	/// Any usable token will do for public lookups.
	fn lookup_kind(&self) -> TokenKind {
		if self.tokens.access_token(TokenKind::Chat).is_some() {
			TokenKind::Chat
		} else {
			TokenKind::Broadcaster
		}
	}
}

#[async_trait]
impl RewardCatalog for HelixClient {
	async fn list_rewards(&self, broadcaster_id: &str) -> Result<Vec<RemoteReward>, PlatformError> {
		const OP: &str = "helix GET custom_rewards";
		let url = self.url(
			&format!(
				"{CUSTOM_REWARDS_PATH}?broadcaster_id={}&only_manageable_rewards=true",
				urlencoding::encode(broadcaster_id)
			),
			OP,
		)?;
		let resp = send_with_retry(self.authed(self.http.get(url), TokenKind::Broadcaster)?, OP).await?;
		let body = success_body(resp, OP).await?;
		parse_rewards(&body, OP)
	}

	async fn create_reward(&self, broadcaster_id: &str, reward: &NewReward) -> Result<RemoteReward, PlatformError> {
		const OP: &str = "helix POST custom_rewards";
		let url = self.reward_url(broadcaster_id, None, OP)?;
		let req = HelixCreateReward {
			title: &reward.title,
			prompt: &reward.prompt,
			cost: reward.cost,
			is_user_input_required: reward.is_user_input_required,
			should_redemptions_skip_request_queue: reward.should_redemptions_skip_request_queue,
		};
		let resp = send_with_retry(self.authed(self.http.post(url), TokenKind::Broadcaster)?.json(&req), OP).await?;
		let body = success_body(resp, OP).await?;
		parse_rewards(&body, OP)?
			.into_iter()
			.next()
			.ok_or_else(|| PlatformError::Decode {
				op: OP,
				message: "empty data array".to_string(),
			})
	}

	async fn set_reward_paused(
		&self,
		broadcaster_id: &str,
		reward_id: &RewardId,
		paused: bool,
	) -> Result<(), PlatformError> {
		const OP: &str = "helix PATCH custom_rewards";
		let url = self.reward_url(broadcaster_id, Some(reward_id), OP)?;
		let req = HelixUpdateRewardPaused { is_paused: paused };
		let resp = send_with_retry(self.authed(self.http.patch(url), TokenKind::Broadcaster)?.json(&req), OP).await?;
		success_body(resp, OP).await?;
		Ok(())
	}

	async fn delete_reward(&self, broadcaster_id: &str, reward_id: &RewardId) -> Result<(), PlatformError> {
		const OP: &str = "helix DELETE custom_rewards";
		let url = self.reward_url(broadcaster_id, Some(reward_id), OP)?;
		let resp = send_with_retry(self.authed(self.http.delete(url), TokenKind::Broadcaster)?, OP).await?;
		success_body(resp, OP).await?;
		Ok(())
	}
}

#[async_trait]
impl UserDirectory for HelixClient {
	async fn user_by_login(&self, login: &str) -> Result<Option<TwitchUser>, PlatformError> {
		const OP: &str = "helix GET users";
		let url = self.url(&format!("{USERS_PATH}?login={}", urlencoding::encode(login)), OP)?;
		let resp = send_with_retry(self.authed(self.http.get(url), self.lookup_kind())?, OP).await?;
		let body = success_body(resp, OP).await?;
		let parsed: HelixDataResponse<TwitchUser> = parse_json(&body, OP)?;
		Ok(parsed.data.into_iter().next())
	}
}

#[async_trait]
impl ChatSink for HelixClient {
	async fn send_chat(&self, broadcaster_id: &str, text: &str) -> Result<(), PlatformError> {
		const OP: &str = "helix POST chat/messages";
		let sender_id = self
			.tokens
			.user_id(TokenKind::Chat)
			.ok_or(PlatformError::MissingCredentials(TokenKind::Chat))?;
		let url = self.url(CHAT_MESSAGES_PATH, OP)?;
		let req = HelixSendChatMessage {
			broadcaster_id,
			sender_id: &sender_id,
			message: text,
		};
		let resp = send_with_retry(self.authed(self.http.post(url), TokenKind::Chat)?.json(&req), OP).await?;
		success_body(resp, OP).await?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use reqwest::header::HeaderValue;

	use super::*;

	#[test]
	fn parses_reward_listing() {
		let body = r#"{"data":[
			{"broadcaster_id":"1","id":"r-1","title":"Emotes","prompt":"vote - ID: 3","cost":100,
			 "is_enabled":true,"is_paused":false,"is_user_input_required":false},
			{"broadcaster_id":"1","id":"r-2","title":"Game - open Entry!","prompt":"","cost":100,
			 "is_enabled":true,"is_paused":true,"is_user_input_required":true}
		]}"#;

		let rewards = parse_rewards(body, "test").expect("parse rewards");
		assert_eq!(rewards.len(), 2);
		assert_eq!(rewards[0].id.as_str(), "r-1");
		assert!(!rewards[0].is_paused);
		assert!(rewards[1].is_paused);
		assert!(rewards[1].is_user_input_required);
	}

	#[test]
	fn reward_with_sentinel_id_is_a_decode_error() {
		let body = r#"{"data":[{"id":"0","title":"x","cost":1}]}"#;
		let err = parse_rewards(body, "test").expect_err("sentinel id rejected");
		assert!(matches!(err, PlatformError::Decode { .. }));
	}

	#[test]
	fn retry_after_header_is_honoured() {
		let mut headers = HeaderMap::new();
		headers.insert(RETRY_AFTER, HeaderValue::from_static("3"));
		assert_eq!(retry_delay_from_headers(&headers), Some(Duration::from_secs(3)));
		assert_eq!(retry_delay_from_headers(&HeaderMap::new()), None);
	}
}

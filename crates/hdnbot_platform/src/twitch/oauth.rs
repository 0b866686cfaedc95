#![forbid(unsafe_code)]

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use url::Url;

use crate::{OAuthEndpoint, PlatformError, SecretString, TokenGrant, TokenValidation};

const VALIDATE_PATH: &str = "/oauth2/validate";
const TOKEN_PATH: &str = "/oauth2/token";

/// Twitch OAuth endpoints (`id.twitch.tv`).
#[derive(Clone, Debug)]
pub struct TwitchOAuth {
	http: reqwest::Client,
	base_url: Url,
	client_id: String,
	client_secret: SecretString,
}

impl TwitchOAuth {
	pub fn new(base_url: Url, client_id: impl Into<String>, client_secret: SecretString) -> anyhow::Result<Self> {
		let http = reqwest::Client::builder()
			.user_agent("hdnbot/0.x (oauth)")
			.timeout(Duration::from_secs(30))
			.build()
			.map_err(|e| anyhow::anyhow!("build reqwest client: {e}"))?;

		Ok(Self {
			http,
			base_url,
			client_id: client_id.into(),
			client_secret,
		})
	}

	fn url(&self, path: &str, op: &'static str) -> Result<Url, PlatformError> {
		self.base_url.join(path).map_err(|e| PlatformError::InvalidRequest {
			op,
			message: format!("join oauth url: {e}"),
		})
	}

	async fn grant(&self, params: &[(&str, &str)], op: &'static str) -> Result<TokenGrant, PlatformError> {
		let url = self.url(TOKEN_PATH, op)?;
		let mut form: Vec<(&str, &str)> = vec![
			("client_id", self.client_id.as_str()),
			("client_secret", self.client_secret.expose()),
		];
		form.extend_from_slice(params);

		let resp = self
			.http
			.post(url)
			.form(&form)
			.send()
			.await
			.map_err(|e| PlatformError::network(op, &e))?;

		let status = resp.status();
		let body = resp.text().await.map_err(|e| PlatformError::network(op, &e))?;

		// Twitch answers a dead refresh token or a reused code with 400.
		if status == StatusCode::BAD_REQUEST || status == StatusCode::UNAUTHORIZED {
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

		serde_json::from_str(&body).map_err(|e| PlatformError::decode(op, &e))
	}
}

#[async_trait]
impl OAuthEndpoint for TwitchOAuth {
	async fn validate(&self, access_token: &SecretString) -> Result<TokenValidation, PlatformError> {
		const OP: &str = "twitch validate token";
		let url = self.url(VALIDATE_PATH, OP)?;

		let resp = self
			.http
			.get(url)
			.header("Authorization", format!("OAuth {}", access_token.expose()))
			.send()
			.await
			.map_err(|e| PlatformError::network(OP, &e))?;

		let status = resp.status();
		let body = resp.text().await.map_err(|e| PlatformError::network(OP, &e))?;

		if status == StatusCode::UNAUTHORIZED {
			return Err(PlatformError::Unauthorized {
				op: OP,
				status: status.as_u16(),
				body,
			});
		}
		if !status.is_success() {
			return Err(PlatformError::Api {
				op: OP,
				status: status.as_u16(),
				body,
			});
		}

		serde_json::from_str(&body).map_err(|e| PlatformError::decode(OP, &e))
	}

	async fn refresh(&self, refresh_token: &SecretString) -> Result<TokenGrant, PlatformError> {
		self.grant(
			&[("grant_type", "refresh_token"), ("refresh_token", refresh_token.expose())],
			"twitch refresh token",
		)
		.await
	}

	async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<TokenGrant, PlatformError> {
		self.grant(
			&[
				("grant_type", "authorization_code"),
				("code", code),
				("redirect_uri", redirect_uri),
			],
			"twitch exchange code",
		)
		.await
	}
}

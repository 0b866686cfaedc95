#![forbid(unsafe_code)]

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use hdnbot_platform::SecretString;
use hdnbot_platform::twitch::{DEFAULT_HELIX_BASE_URL, DEFAULT_OAUTH_BASE_URL, DEFAULT_PUBSUB_URL};
use serde::Deserialize;
use tracing::info;
use url::Url;

use crate::bus::BusConfig;
use crate::rewards::RewardSettings;
use crate::tokens::TokenSeeds;

/// Env var naming an alternative config file.
pub const CONFIG_PATH_ENV: &str = "HDNBOT_CONFIG";

/// Default config path: `~/.hdnbot/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".hdnbot").join("config.toml"))
}

/// Load the bot config from TOML and `HDNBOT_*` env overrides.
pub fn load_config_from_path(path: &Path) -> anyhow::Result<BotConfig> {
	load_with_env(path, |key| std::env::var(key).ok())
}

fn load_with_env(path: &Path, env: impl Fn(&str) -> Option<String>) -> anyhow::Result<BotConfig> {
	let mut file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	apply_env_overrides(&mut file_cfg, env);

	Ok(BotConfig::from_file(file_cfg)?)
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
	#[error("missing required settings: {}", .0.join(", "))]
	Missing(Vec<&'static str>),

	#[error("invalid {key}: {reason}")]
	Invalid { key: &'static str, reason: String },
}

/// Validated bot config.
#[derive(Debug, Clone)]
pub struct BotConfig {
	pub twitch: TwitchSettings,
	pub tokens: TokenSeeds,
	pub rewards: RewardSettings,
	pub bus: BusConfig,
	/// Bounded queue between the PubSub session and the dispatcher.
	pub redemption_queue: usize,
	/// How often both tokens are validated again.
	pub revalidate_interval: Duration,
	pub database_url: String,
	pub metrics_bind: Option<SocketAddr>,
}

#[derive(Debug, Clone)]
pub struct TwitchSettings {
	pub client_id: String,
	pub client_secret: SecretString,
	/// Login of the channel the bot serves.
	pub channel: String,
	/// Skips the login lookup when set.
	pub broadcaster_id: Option<String>,
	/// Account the chat token must belong to, when set.
	pub bot_login: Option<String>,
	pub redirect_uri: String,
	pub helix_url: Url,
	pub oauth_url: Url,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	twitch: FileTwitchSettings,

	#[serde(default)]
	tokens: FileTokenSettings,

	#[serde(default)]
	rewards: FileRewardSettings,

	#[serde(default)]
	pubsub: FilePubSubSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,

	#[serde(default)]
	server: FileServerSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileTwitchSettings {
	client_id: Option<String>,
	client_secret: Option<String>,
	channel: Option<String>,
	broadcaster_id: Option<String>,
	bot_login: Option<String>,
	redirect_uri: Option<String>,
	helix_url: Option<String>,
	oauth_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileTokenSettings {
	chat_refresh_token: Option<String>,
	broadcaster_refresh_token: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileRewardSettings {
	cost: Option<u32>,
	default_max_votes: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePubSubSettings {
	url: Option<String>,
	keepalive_initial_secs: Option<u64>,
	keepalive_initial_jitter_secs: Option<u64>,
	keepalive_period_secs: Option<u64>,
	keepalive_jitter_secs: Option<u64>,
	reconnect_jitter_ms: Option<u64>,
	redemption_queue: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	metrics_bind: Option<String>,
	revalidate_interval_secs: Option<u64>,
}

fn non_empty(v: Option<String>) -> Option<String> {
	v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn parse_url(key: &'static str, raw: Option<String>, default: &str) -> Result<Url, ConfigError> {
	let raw = non_empty(raw).unwrap_or_else(|| default.to_string());
	Url::parse(&raw).map_err(|e| ConfigError::Invalid {
		key,
		reason: format!("{raw:?}: {e}"),
	})
}

fn positive<T: PartialOrd + Default>(key: &'static str, v: T) -> Result<T, ConfigError> {
	if v > T::default() {
		Ok(v)
	} else {
		Err(ConfigError::Invalid {
			key,
			reason: "must be greater than zero".to_string(),
		})
	}
}

impl BotConfig {
	fn from_file(file: FileConfig) -> Result<Self, ConfigError> {
		let client_id = non_empty(file.twitch.client_id);
		let client_secret = non_empty(file.twitch.client_secret);
		let channel = non_empty(file.twitch.channel).map(|c| c.trim_start_matches('#').to_ascii_lowercase());
		let database_url = non_empty(file.persistence.database_url);

		let mut missing = Vec::new();
		if client_id.is_none() {
			missing.push("twitch.client_id");
		}
		if client_secret.is_none() {
			missing.push("twitch.client_secret");
		}
		if channel.is_none() {
			missing.push("twitch.channel");
		}
		if database_url.is_none() {
			missing.push("persistence.database_url");
		}
		let (Some(client_id), Some(client_secret), Some(channel), Some(database_url)) =
			(client_id, client_secret, channel, database_url)
		else {
			return Err(ConfigError::Missing(missing));
		};

		let twitch = TwitchSettings {
			client_id,
			client_secret: SecretString::new(client_secret),
			channel,
			broadcaster_id: non_empty(file.twitch.broadcaster_id),
			bot_login: non_empty(file.twitch.bot_login).map(|l| l.to_ascii_lowercase()),
			redirect_uri: non_empty(file.twitch.redirect_uri).unwrap_or_else(|| "http://localhost:3000".to_string()),
			helix_url: parse_url("twitch.helix_url", file.twitch.helix_url, DEFAULT_HELIX_BASE_URL)?,
			oauth_url: parse_url("twitch.oauth_url", file.twitch.oauth_url, DEFAULT_OAUTH_BASE_URL)?,
		};

		let tokens = TokenSeeds {
			chat_refresh_token: non_empty(file.tokens.chat_refresh_token).map(SecretString::new),
			broadcaster_refresh_token: non_empty(file.tokens.broadcaster_refresh_token).map(SecretString::new),
		};

		let defaults = RewardSettings::default();
		let rewards = RewardSettings {
			cost: positive("rewards.cost", file.rewards.cost.unwrap_or(defaults.cost))?,
			default_max_votes: positive(
				"rewards.default_max_votes",
				file.rewards.default_max_votes.unwrap_or(defaults.default_max_votes),
			)?,
		};

		let p = file.pubsub;
		let mut bus = BusConfig::new(parse_url("pubsub.url", p.url, DEFAULT_PUBSUB_URL)?);
		if let Some(secs) = p.keepalive_initial_secs {
			bus.keepalive_initial = Duration::from_secs(positive("pubsub.keepalive_initial_secs", secs)?);
		}
		if let Some(secs) = p.keepalive_initial_jitter_secs {
			bus.keepalive_initial_jitter = Duration::from_secs(secs);
		}
		if let Some(secs) = p.keepalive_period_secs {
			bus.keepalive_period = Duration::from_secs(positive("pubsub.keepalive_period_secs", secs)?);
		}
		if let Some(secs) = p.keepalive_jitter_secs {
			bus.keepalive_jitter = Duration::from_secs(secs);
		}
		if let Some(ms) = p.reconnect_jitter_ms {
			bus.reconnect_jitter = Duration::from_millis(ms);
		}

		let metrics_bind = match non_empty(file.server.metrics_bind) {
			Some(bind) => Some(bind.parse::<SocketAddr>().map_err(|e| ConfigError::Invalid {
				key: "server.metrics_bind",
				reason: format!("{bind:?} (expected host:port): {e}"),
			})?),
			None => None,
		};

		Ok(Self {
			twitch,
			tokens,
			rewards,
			bus,
			redemption_queue: positive("pubsub.redemption_queue", p.redemption_queue.unwrap_or(256))?,
			revalidate_interval: Duration::from_secs(positive(
				"server.revalidate_interval_secs",
				file.server.revalidate_interval_secs.unwrap_or(3600),
			)?),
			database_url,
			metrics_bind,
		})
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut FileConfig, env: impl Fn(&str) -> Option<String>) {
	let var = |key: &str| non_empty(env(key));

	if let Some(v) = var("HDNBOT_TWITCH_CLIENT_ID") {
		cfg.twitch.client_id = Some(v);
		info!("twitch config: client_id overridden by env");
	}

	if let Some(v) = var("HDNBOT_TWITCH_CLIENT_SECRET") {
		cfg.twitch.client_secret = Some(v);
		info!("twitch config: client_secret overridden by env");
	}

	if let Some(v) = var("HDNBOT_TWITCH_CHANNEL") {
		cfg.twitch.channel = Some(v);
		info!("twitch config: channel overridden by env");
	}

	if let Some(v) = var("HDNBOT_TWITCH_BROADCASTER_ID") {
		cfg.twitch.broadcaster_id = Some(v);
		info!("twitch config: broadcaster_id overridden by env");
	}

	if let Some(v) = var("HDNBOT_TWITCH_BOT_LOGIN") {
		cfg.twitch.bot_login = Some(v);
		info!("twitch config: bot_login overridden by env");
	}

	if let Some(v) = var("HDNBOT_TWITCH_REDIRECT_URI") {
		cfg.twitch.redirect_uri = Some(v);
		info!("twitch config: redirect_uri overridden by env");
	}

	if let Some(v) = var("HDNBOT_CHAT_REFRESH_TOKEN") {
		cfg.tokens.chat_refresh_token = Some(v);
		info!("tokens: chat_refresh_token overridden by env");
	}

	if let Some(v) = var("HDNBOT_BROADCASTER_REFRESH_TOKEN") {
		cfg.tokens.broadcaster_refresh_token = Some(v);
		info!("tokens: broadcaster_refresh_token overridden by env");
	}

	if let Some(v) = var("HDNBOT_PUBSUB_URL") {
		cfg.pubsub.url = Some(v);
		info!("pubsub config: url overridden by env");
	}

	if let Some(v) = var("HDNBOT_RECONNECT_JITTER_MS")
		&& let Ok(ms) = v.parse::<u64>()
	{
		cfg.pubsub.reconnect_jitter_ms = Some(ms);
		info!(ms, "pubsub config: reconnect_jitter_ms overridden by env");
	}

	if let Some(v) = var("HDNBOT_REWARD_COST")
		&& let Ok(cost) = v.parse::<u32>()
	{
		cfg.rewards.cost = Some(cost);
		info!(cost, "rewards config: cost overridden by env");
	}

	if let Some(v) = var("HDNBOT_DATABASE_URL") {
		cfg.persistence.database_url = Some(v);
		info!("persistence: database_url overridden by env");
	}

	if let Some(v) = var("HDNBOT_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;
	use std::io::Write;

	use super::*;

	const MINIMAL: &str = r##"
[twitch]
client_id = "cid"
client_secret = "secret"
channel = "#Streamer"

[persistence]
database_url = "memory:"
"##;

	fn write_config(contents: &str) -> tempfile::NamedTempFile {
		let mut file = tempfile::NamedTempFile::new().expect("temp file");
		file.write_all(contents.as_bytes()).expect("write config");
		file
	}

	fn no_env(_: &str) -> Option<String> {
		None
	}

	#[test]
	fn minimal_config_gets_defaults() {
		let file = write_config(MINIMAL);
		let cfg = load_with_env(file.path(), no_env).unwrap();

		assert_eq!(cfg.twitch.channel, "streamer");
		assert_eq!(cfg.twitch.client_secret.expose(), "secret");
		assert_eq!(cfg.twitch.helix_url.as_str(), "https://api.twitch.tv/");
		assert_eq!(cfg.bus.url.as_str(), "wss://pubsub-edge.twitch.tv/");
		assert_eq!(cfg.bus.keepalive_initial, Duration::from_secs(280));
		assert_eq!(cfg.bus.reconnect_jitter, Duration::from_millis(5000));
		assert_eq!(cfg.rewards, RewardSettings::default());
		assert_eq!(cfg.redemption_queue, 256);
		assert_eq!(cfg.revalidate_interval, Duration::from_secs(3600));
		assert!(cfg.metrics_bind.is_none());
		assert!(cfg.tokens.broadcaster_refresh_token.is_none());
	}

	#[test]
	fn missing_file_reports_every_required_key() {
		let dir = tempfile::tempdir().expect("temp dir");
		let err = load_with_env(&dir.path().join("absent.toml"), no_env).expect_err("nothing configured");
		match err.downcast_ref::<ConfigError>() {
			Some(ConfigError::Missing(keys)) => assert_eq!(
				keys,
				&vec![
					"twitch.client_id",
					"twitch.client_secret",
					"twitch.channel",
					"persistence.database_url"
				]
			),
			other => panic!("expected Missing, got: {other:?}"),
		}
	}

	#[test]
	fn env_overrides_file_values() {
		let file = write_config(MINIMAL);
		let env: HashMap<&str, &str> = HashMap::from([
			("HDNBOT_TWITCH_CHANNEL", "other"),
			("HDNBOT_DATABASE_URL", " sqlite://bot.db "),
			("HDNBOT_REWARD_COST", "250"),
			("HDNBOT_RECONNECT_JITTER_MS", "not-a-number"),
			("HDNBOT_BROADCASTER_REFRESH_TOKEN", "seed"),
			("HDNBOT_METRICS_BIND", "   "),
		]);
		let cfg = load_with_env(file.path(), |k| env.get(k).map(|v| v.to_string())).unwrap();

		assert_eq!(cfg.twitch.channel, "other");
		assert_eq!(cfg.database_url, "sqlite://bot.db");
		assert_eq!(cfg.rewards.cost, 250);
		assert_eq!(cfg.bus.reconnect_jitter, Duration::from_millis(5000));
		assert_eq!(
			cfg.tokens.broadcaster_refresh_token.as_ref().map(|t| t.expose()),
			Some("seed")
		);
		assert!(cfg.metrics_bind.is_none());
	}

	#[test]
	fn invalid_values_are_rejected() {
		let file = write_config(&format!("{MINIMAL}\n[rewards]\ncost = 0\n"));
		let err = load_with_env(file.path(), no_env).expect_err("zero cost");
		assert_eq!(
			err.downcast_ref::<ConfigError>(),
			Some(&ConfigError::Invalid {
				key: "rewards.cost",
				reason: "must be greater than zero".to_string()
			})
		);

		let file = write_config(&format!("{MINIMAL}\n[server]\nmetrics_bind = \"nope\"\n"));
		let err = load_with_env(file.path(), no_env).expect_err("bad bind");
		assert!(err.to_string().contains("server.metrics_bind"));
	}

	#[test]
	fn pubsub_timings_are_configurable() {
		let file = write_config(&format!(
			"{MINIMAL}\n[pubsub]\nurl = \"ws://127.0.0.1:9000\"\nkeepalive_period_secs = 60\nreconnect_jitter_ms = 0\n"
		));
		let cfg = load_with_env(file.path(), no_env).unwrap();
		assert_eq!(cfg.bus.url.as_str(), "ws://127.0.0.1:9000/");
		assert_eq!(cfg.bus.keepalive_period, Duration::from_secs(60));
		assert_eq!(cfg.bus.reconnect_jitter, Duration::ZERO);
	}

	#[test]
	fn malformed_toml_is_an_error() {
		let file = write_config("[twitch\nclient_id = ");
		let err = load_with_env(file.path(), no_env).expect_err("malformed");
		assert!(format!("{err:#}").contains("parse TOML"));
	}
}

#![forbid(unsafe_code)]

//! Twitch PubSub wire format.
//!
//! Client frames are `LISTEN` and `PING`. Server frames carry a `type` of `PONG`,
//! `RECONNECT`, `RESPONSE` or `MESSAGE`; a `MESSAGE` nests a second JSON document
//! as a string in `data.message`.

use std::time::SystemTime;

use anyhow::Context;
use hdnbot_domain::{RedeemedReward, RedeemingUser, Redemption, RewardId};
use serde::{Deserialize, Serialize};
use tracing::warn;


/// Topic prefix for channel-points redemptions.
pub const CHANNEL_POINTS_TOPIC_PREFIX: &str = "channel-points-channel-v1.";

/// `channel-points-channel-v1.<broadcaster_id>`
pub fn channel_points_topic(broadcaster_id: &str) -> String {
	format!("{CHANNEL_POINTS_TOPIC_PREFIX}{broadcaster_id}")
}

pub fn is_channel_points_topic(topic: &str) -> bool {
	topic.starts_with(CHANNEL_POINTS_TOPIC_PREFIX)
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
enum ClientFrame<'a> {
	Listen { nonce: &'a str, data: ListenData<'a> },
	Ping,
}

#[derive(Debug, Serialize)]
struct ListenData<'a> {
	topics: &'a [String],
	auth_token: &'a str,
}

/// Encode a `LISTEN` frame.
pub fn listen_frame(nonce: &str, topics: &[String], auth_token: &str) -> anyhow::Result<String> {
	let frame = ClientFrame::Listen {
		nonce,
		data: ListenData { topics, auth_token },
	};
	serde_json::to_string(&frame).context("encode pubsub LISTEN")
}

/// Encode a `PING` frame.
pub fn ping_frame() -> anyhow::Result<String> {
	serde_json::to_string(&ClientFrame::Ping).context("encode pubsub PING")
}

/// A decoded server frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
	Pong,
	Reconnect,
	Response {
		nonce: Option<String>,
		/// `None` when the request succeeded.
		error: Option<String>,
	},
	Message {
		topic: String,
		message: String,
	},
	Other {
		kind: String,
		raw: String,
	},
}

#[derive(Debug, Deserialize)]
struct RawServerFrame {
	#[serde(rename = "type")]
	kind: String,
	#[serde(default)]
	nonce: Option<String>,
	#[serde(default)]
	error: Option<String>,
	#[serde(default)]
	data: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RawMessageData {
	topic: String,
	message: String,
}

/// Decode one text frame from the server.
pub fn decode_server_frame(raw: &str) -> anyhow::Result<ServerFrame> {
	let frame: RawServerFrame = serde_json::from_str(raw).context("parse pubsub frame")?;

	let decoded = match frame.kind.as_str() {
		"PONG" => ServerFrame::Pong,
		"RECONNECT" => ServerFrame::Reconnect,
		"RESPONSE" => ServerFrame::Response {
			nonce: frame.nonce.filter(|n| !n.is_empty()),
			error: frame.error.filter(|e| !e.is_empty()),
		},
		"MESSAGE" => {
			let data = frame.data.context("pubsub MESSAGE without data")?;
			let data: RawMessageData = serde_json::from_value(data).context("parse pubsub MESSAGE data")?;
			ServerFrame::Message {
				topic: data.topic,
				message: data.message,
			}
		}
		_ => ServerFrame::Other {
			kind: frame.kind,
			raw: raw.to_string(),
		},
	};

	Ok(decoded)
}

#[derive(Debug, Deserialize)]
struct ChannelPointsEnvelope {
	#[serde(rename = "type")]
	kind: String,
	data: Option<ChannelPointsData>,
}

#[derive(Debug, Deserialize)]
struct ChannelPointsData {
	redemption: Option<RawRedemption>,
}

#[derive(Debug, Deserialize)]
struct RawRedemption {
	id: String,
	user: RawUser,
	reward: RawReward,
	#[serde(default)]
	user_input: Option<String>,
	#[serde(default)]
	redeemed_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawUser {
	id: String,
	login: String,
	#[serde(default)]
	display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawReward {
	id: String,
	title: String,
	cost: u32,
	#[serde(default)]
	is_user_input_required: bool,
}

/// Decode the nested channel-points payload of a `MESSAGE` frame.
///
/// Returns `Ok(None)` for channel-points events other than `reward-redeemed`.
pub fn decode_redemption(message: &str) -> anyhow::Result<Option<Redemption>> {
	let envelope: ChannelPointsEnvelope = serde_json::from_str(message).context("parse channel-points message")?;
	if envelope.kind != "reward-redeemed" {
		return Ok(None);
	}

	let raw = envelope
		.data
		.and_then(|d| d.redemption)
		.context("reward-redeemed without redemption")?;

	let reward_id = RewardId::new(raw.reward.id).context("construct RewardId from redemption reward.id")?;
	let redeemed_at = raw.redeemed_at.as_deref().and_then(|ts| match parse_timestamp(ts) {
		Ok(at) => Some(at),
		Err(e) => {
			warn!(redemption_id = %raw.id, redeemed_at = ts, error = ?e, "ignoring malformed redeemed_at");
			None
		}
	});

	let display_name = raw.user.display_name.unwrap_or_else(|| raw.user.login.clone());

	Ok(Some(Redemption {
		id: raw.id,
		user: RedeemingUser {
			id: raw.user.id,
			login: raw.user.login,
			display_name,
		},
		reward: RedeemedReward {
			id: reward_id,
			title: raw.reward.title,
			cost: raw.reward.cost,
			is_user_input_required: raw.reward.is_user_input_required,
		},
		user_input: raw.user_input,
		redeemed_at,
	}))
}

/// RFC3339 timestamp (fractional seconds, Zulu) to `SystemTime`.
fn parse_timestamp(ts: &str) -> anyhow::Result<SystemTime> {
	let dt = chrono::DateTime::parse_from_rfc3339(ts).context("parse RFC3339 timestamp")?;
	Ok(SystemTime::from(dt.with_timezone(&chrono::Utc)))
}

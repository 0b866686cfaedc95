#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The two credential kinds the bot holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
	/// Bot account token used for chat.
	Chat,
	/// Channel owner token used for channel points.
	Broadcaster,
}

const CHAT_SCOPES: &[&str] = &["chat:read", "chat:edit"];

const BROADCASTER_SCOPES: &[&str] = &[
	"user:edit:broadcast",
	"channel:read:redemptions",
	"channel:manage:redemptions",
	"chat:edit",
	"chat:read",
];

impl TokenKind {
	pub const ALL: [TokenKind; 2] = [TokenKind::Chat, TokenKind::Broadcaster];

	/// Stable string identifier (also the persistence key).
	pub const fn as_str(self) -> &'static str {
		match self {
			TokenKind::Chat => "chat",
			TokenKind::Broadcaster => "broadcaster",
		}
	}

	/// Scopes a token of this kind must carry to be usable.
	pub const fn required_scopes(self) -> &'static [&'static str] {
		match self {
			TokenKind::Chat => CHAT_SCOPES,
			TokenKind::Broadcaster => BROADCASTER_SCOPES,
		}
	}

	/// Required scopes absent from `granted`, in declaration order.
	pub fn missing_scopes<S: AsRef<str>>(self, granted: &[S]) -> Vec<&'static str> {
		self.required_scopes()
			.iter()
			.copied()
			.filter(|required| !granted.iter().any(|g| g.as_ref() == *required))
			.collect()
	}
}

impl fmt::Display for TokenKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("unknown token kind: {0}")]
	UnknownTokenKind(String),
	#[error("reward id {0:?} is reserved for unbound units")]
	ReservedRewardId(String),
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

impl FromStr for TokenKind {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"chat" | "bot" => Ok(TokenKind::Chat),
			"broadcaster" | "channel" => Ok(TokenKind::Broadcaster),
			other => Err(ParseIdError::UnknownTokenKind(other.to_string())),
		}
	}
}

/// Remote reward identifier. Never the unbound sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RewardId(String);

impl RewardId {
	/// Column value marking a unit with no remote reward.
	pub const UNBOUND_SENTINEL: &'static str = "0";

	/// Create a non-empty, non-sentinel `RewardId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		let trimmed = id.trim();
		if trimmed.is_empty() {
			return Err(ParseIdError::Empty);
		}
		if trimmed == Self::UNBOUND_SENTINEL {
			return Err(ParseIdError::ReservedRewardId(id));
		}
		Ok(Self(trimmed.to_string()))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for RewardId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for RewardId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		RewardId::new(s.to_string())
	}
}

impl TryFrom<String> for RewardId {
	type Error = ParseIdError;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		RewardId::new(value)
	}
}

impl From<RewardId> for String {
	fn from(value: RewardId) -> Self {
		value.0
	}
}

/// Link between a local unit and its remote reward.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RewardBinding {
	#[default]
	Unbound,
	Bound(RewardId),
}

impl RewardBinding {
	/// Decode a persisted `reward_id` column. The sentinel and blanks are unbound.
	pub fn from_column(raw: &str) -> Self {
		match RewardId::new(raw) {
			Ok(id) => RewardBinding::Bound(id),
			Err(_) => RewardBinding::Unbound,
		}
	}

	/// Value to persist in a `reward_id` column.
	pub fn as_column(&self) -> &str {
		match self {
			RewardBinding::Unbound => RewardId::UNBOUND_SENTINEL,
			RewardBinding::Bound(id) => id.as_str(),
		}
	}

	pub fn reward_id(&self) -> Option<&RewardId> {
		match self {
			RewardBinding::Unbound => None,
			RewardBinding::Bound(id) => Some(id),
		}
	}

	pub fn is_bound(&self) -> bool {
		matches!(self, RewardBinding::Bound(_))
	}
}

impl From<RewardId> for RewardBinding {
	fn from(value: RewardId) -> Self {
		RewardBinding::Bound(value)
	}
}

impl fmt::Display for RewardBinding {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			RewardBinding::Unbound => f.write_str("unbound"),
			RewardBinding::Bound(id) => f.write_str(id.as_str()),
		}
	}
}

/// Database id of an incentive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IncentiveId(pub i64);

impl fmt::Display for IncentiveId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Database id of a choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChoiceId(pub i64);

impl fmt::Display for ChoiceId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Database id of a choice option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OptionId(pub i64);

impl fmt::Display for OptionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// A capped goal; every redemption of its reward adds one vote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Incentive {
	pub id: IncentiveId,
	pub name: String,
	pub description: String,
	pub reward: RewardBinding,
	pub current_votes: u32,
	pub max_votes: u32,
	pub is_closed: bool,
}

impl Incentive {
	pub fn is_complete(&self) -> bool {
		self.current_votes >= self.max_votes
	}

	/// Whether the backing reward should be paused.
	pub fn wants_paused(&self) -> bool {
		self.is_closed || self.is_complete()
	}

	/// One-line status, e.g. `Emotes: new sub emotes [3/10 Votes]`.
	pub fn progress_line(&self) -> String {
		format!(
			"{}: {} [{}/{} Votes]",
			self.name, self.description, self.current_votes, self.max_votes
		)
	}
}

/// A vote between options. Open-entry choices take free-text options from viewers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Choice {
	pub id: ChoiceId,
	pub name: String,
	pub description: String,
	pub has_open_entry: bool,
	/// Only ever bound for open-entry choices.
	pub reward: RewardBinding,
	pub is_closed: bool,
	pub options: Vec<ChoiceOption>,
}

impl Choice {
	pub fn wants_paused(&self) -> bool {
		self.is_closed
	}

	/// Options ordered by votes (descending), ties by id.
	pub fn standings(&self) -> Vec<&ChoiceOption> {
		let mut out: Vec<&ChoiceOption> = self.options.iter().collect();
		out.sort_by(|a, b| b.votes.cmp(&a.votes).then(a.id.cmp(&b.id)));
		out
	}
}

/// One alternative under a [`Choice`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChoiceOption {
	pub id: OptionId,
	pub choice_id: ChoiceId,
	pub name: String,
	/// Only ever bound for options of closed-entry choices.
	pub reward: RewardBinding,
	pub votes: u32,
}

/// Snapshot of a reward in the remote catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteReward {
	pub id: RewardId,
	pub title: String,
	pub prompt: String,
	pub cost: u32,
	pub is_paused: bool,
	pub is_enabled: bool,
	pub is_user_input_required: bool,
}

/// Parameters for creating a reward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewReward {
	pub title: String,
	pub prompt: String,
	pub cost: u32,
	pub is_user_input_required: bool,
	pub should_redemptions_skip_request_queue: bool,
}

/// Viewer who redeemed a reward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedeemingUser {
	pub id: String,
	pub login: String,
	pub display_name: String,
}

/// Reward details carried by a redemption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedeemedReward {
	pub id: RewardId,
	pub title: String,
	pub cost: u32,
	pub is_user_input_required: bool,
}

/// A viewer spending channel points on a reward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redemption {
	pub id: String,
	pub user: RedeemingUser,
	pub reward: RedeemedReward,
	pub user_input: Option<String>,
	pub redeemed_at: Option<SystemTime>,
}

impl Redemption {
	pub fn reward_id(&self) -> &RewardId {
		&self.reward.id
	}

	/// Free-text input with surrounding whitespace removed; `None` when blank.
	pub fn trimmed_input(&self) -> Option<&str> {
		self.user_input.as_deref().map(str::trim).filter(|s| !s.is_empty())
	}
}

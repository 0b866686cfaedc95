#![forbid(unsafe_code)]

//! In-process fakes for the Twitch-facing seams.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::{Sink, Stream};
use hdnbot_domain::{
	NewReward, RedeemedReward, RedeemingUser, Redemption, RemoteReward, RewardId, TokenKind,
};
use hdnbot_platform::{
	ChatSink, OAuthEndpoint, PlatformError, RewardCatalog, SecretString, TokenGrant, TokenValidation, TwitchUser,
	UserDirectory,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use url::Url;

use crate::bus::{BoxedWs, WsConnector};
use crate::identity::BroadcasterIdentity;
use crate::rewards::Announcer;
use crate::store::{MemoryStore, Store, StoredToken};
use crate::tokens::{TokenManager, TokenSeeds};

pub(crate) const BROADCASTER_ID: &str = "b-1";
pub(crate) const BROADCASTER_LOGIN: &str = "streamer";
pub(crate) const BOT_LOGIN: &str = "hdnbot";

#[derive(Debug, Clone, Copy)]
pub(crate) enum FakeFailure {
	Unauthorized,
	Network,
}

impl FakeFailure {
	fn error(self, op: &'static str) -> PlatformError {
		match self {
			FakeFailure::Unauthorized => PlatformError::Unauthorized {
				op,
				status: 401,
				body: r#"{"status":401,"message":"invalid access token"}"#.to_string(),
			},
			FakeFailure::Network => PlatformError::Network {
				op,
				message: "connection refused".to_string(),
			},
		}
	}
}

pub(crate) fn login_of(kind: TokenKind) -> &'static str {
	match kind {
		TokenKind::Chat => BOT_LOGIN,
		TokenKind::Broadcaster => BROADCASTER_LOGIN,
	}
}

pub(crate) fn user_id_of(kind: TokenKind) -> &'static str {
	match kind {
		TokenKind::Chat => "bot-1",
		TokenKind::Broadcaster => BROADCASTER_ID,
	}
}

pub(crate) fn grant(access: &str, refresh: Option<&str>, expires_in: u64) -> TokenGrant {
	TokenGrant {
		access_token: SecretString::new(access),
		refresh_token: refresh.map(SecretString::new),
		expires_in,
		scope: Vec::new(),
	}
}

/// OAuth endpoint with scripted answers.
#[derive(Default)]
pub(crate) struct FakeOAuth {
	validations: Mutex<HashMap<String, Result<TokenValidation, FakeFailure>>>,
	refreshes: Mutex<VecDeque<Result<TokenGrant, FakeFailure>>>,
	codes: Mutex<HashMap<String, TokenGrant>>,
	pub validate_calls: AtomicUsize,
	pub refresh_calls: AtomicUsize,
}

impl FakeOAuth {
	/// Accept `access` as a token of `kind` with every required scope.
	pub fn accept(&self, access: &str, kind: TokenKind, expires_in: u64) {
		self.accept_with(access, kind, kind.required_scopes(), expires_in);
	}

	pub fn accept_with(&self, access: &str, kind: TokenKind, scopes: &[&str], expires_in: u64) {
		self.validations.lock().insert(
			access.to_string(),
			Ok(TokenValidation {
				client_id: "client".to_string(),
				login: Some(login_of(kind).to_string()),
				user_id: Some(user_id_of(kind).to_string()),
				expires_in,
				scopes: scopes.iter().map(|s| s.to_string()).collect(),
			}),
		);
	}

	pub fn fail_validation(&self, access: &str, failure: FakeFailure) {
		self.validations.lock().insert(access.to_string(), Err(failure));
	}

	pub fn queue_refresh(&self, outcome: Result<TokenGrant, FakeFailure>) {
		self.refreshes.lock().push_back(outcome);
	}

	pub fn allow_code(&self, code: &str, grant: TokenGrant) {
		self.codes.lock().insert(code.to_string(), grant);
	}
}

#[async_trait]
impl OAuthEndpoint for FakeOAuth {
	async fn validate(&self, access_token: &SecretString) -> Result<TokenValidation, PlatformError> {
		self.validate_calls.fetch_add(1, Ordering::SeqCst);
		match self.validations.lock().get(access_token.expose()) {
			Some(Ok(v)) => Ok(v.clone()),
			Some(Err(f)) => Err(f.error("fake validate")),
			None => Err(FakeFailure::Unauthorized.error("fake validate")),
		}
	}

	async fn refresh(&self, _refresh_token: &SecretString) -> Result<TokenGrant, PlatformError> {
		self.refresh_calls.fetch_add(1, Ordering::SeqCst);
		match self.refreshes.lock().pop_front() {
			Some(Ok(g)) => Ok(g),
			Some(Err(f)) => Err(f.error("fake refresh")),
			None => Err(FakeFailure::Unauthorized.error("fake refresh")),
		}
	}

	async fn exchange_code(&self, code: &str, _redirect_uri: &str) -> Result<TokenGrant, PlatformError> {
		self.codes
			.lock()
			.remove(code)
			.ok_or_else(|| FakeFailure::Unauthorized.error("fake exchange code"))
	}
}

/// Reward catalog kept in memory, recording every call.
#[derive(Default)]
pub(crate) struct FakeCatalog {
	rewards: Mutex<Vec<RemoteReward>>,
	next_id: AtomicUsize,
	pub created: Mutex<Vec<NewReward>>,
	pub paused: Mutex<Vec<(RewardId, bool)>>,
	pub deleted: Mutex<Vec<RewardId>>,
	pub fail_list: AtomicBool,
}

impl FakeCatalog {
	pub fn seed(&self, id: &str, title: &str, is_paused: bool) -> RewardId {
		let id = RewardId::new(id).expect("seed reward id");
		self.rewards.lock().push(RemoteReward {
			id: id.clone(),
			title: title.to_string(),
			prompt: String::new(),
			cost: 100,
			is_paused,
			is_enabled: true,
			is_user_input_required: false,
		});
		id
	}

	pub fn reward(&self, id: &RewardId) -> Option<RemoteReward> {
		self.rewards.lock().iter().find(|r| &r.id == id).cloned()
	}

	pub fn len(&self) -> usize {
		self.rewards.lock().len()
	}

	pub fn forget(&self, id: &RewardId) {
		self.rewards.lock().retain(|r| &r.id != id);
	}

	fn not_found(op: &'static str) -> PlatformError {
		PlatformError::Api {
			op,
			status: 404,
			body: r#"{"error":"Not Found"}"#.to_string(),
		}
	}
}

#[async_trait]
impl RewardCatalog for FakeCatalog {
	async fn list_rewards(&self, _broadcaster_id: &str) -> Result<Vec<RemoteReward>, PlatformError> {
		if self.fail_list.load(Ordering::SeqCst) {
			return Err(FakeFailure::Network.error("fake list rewards"));
		}
		Ok(self.rewards.lock().clone())
	}

	async fn create_reward(&self, _broadcaster_id: &str, reward: &NewReward) -> Result<RemoteReward, PlatformError> {
		let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
		let created = RemoteReward {
			id: RewardId::new(format!("reward-{n}")).expect("generated reward id"),
			title: reward.title.clone(),
			prompt: reward.prompt.clone(),
			cost: reward.cost,
			is_paused: false,
			is_enabled: true,
			is_user_input_required: reward.is_user_input_required,
		};
		self.created.lock().push(reward.clone());
		self.rewards.lock().push(created.clone());
		Ok(created)
	}

	async fn set_reward_paused(
		&self,
		_broadcaster_id: &str,
		reward_id: &RewardId,
		paused: bool,
	) -> Result<(), PlatformError> {
		let mut rewards = self.rewards.lock();
		let Some(reward) = rewards.iter_mut().find(|r| &r.id == reward_id) else {
			return Err(Self::not_found("fake pause reward"));
		};
		reward.is_paused = paused;
		self.paused.lock().push((reward_id.clone(), paused));
		Ok(())
	}

	async fn delete_reward(&self, _broadcaster_id: &str, reward_id: &RewardId) -> Result<(), PlatformError> {
		let mut rewards = self.rewards.lock();
		let before = rewards.len();
		rewards.retain(|r| &r.id != reward_id);
		if rewards.len() == before {
			return Err(Self::not_found("fake delete reward"));
		}
		self.deleted.lock().push(reward_id.clone());
		Ok(())
	}
}

#[derive(Default)]
pub(crate) struct FakeDirectory {
	users: Mutex<HashMap<String, TwitchUser>>,
	pub lookups: AtomicUsize,
}

impl FakeDirectory {
	pub fn add(&self, login: &str, id: &str) {
		self.users.lock().insert(
			login.to_string(),
			TwitchUser {
				id: id.to_string(),
				login: login.to_string(),
				display_name: login.to_string(),
			},
		);
	}
}

#[async_trait]
impl UserDirectory for FakeDirectory {
	async fn user_by_login(&self, login: &str) -> Result<Option<TwitchUser>, PlatformError> {
		self.lookups.fetch_add(1, Ordering::SeqCst);
		Ok(self.users.lock().get(login).cloned())
	}
}

#[derive(Default)]
pub(crate) struct FakeChat {
	pub sent: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl ChatSink for FakeChat {
	async fn send_chat(&self, broadcaster_id: &str, text: &str) -> Result<(), PlatformError> {
		self.sent.lock().push((broadcaster_id.to_string(), text.to_string()));
		Ok(())
	}
}

#[derive(Default)]
pub(crate) struct RecordingAnnouncer {
	pub lines: Mutex<Vec<String>>,
}

#[async_trait]
impl Announcer for RecordingAnnouncer {
	async fn announce(&self, text: &str) -> anyhow::Result<()> {
		self.lines.lock().push(text.to_string());
		Ok(())
	}
}

pub(crate) fn identity() -> Arc<BroadcasterIdentity> {
	Arc::new(BroadcasterIdentity::new(
		BROADCASTER_LOGIN,
		Some(BROADCASTER_ID.to_string()),
		Arc::new(FakeDirectory::default()),
	))
}

pub(crate) fn access_of(kind: TokenKind) -> String {
	format!("{kind}-access")
}

/// Token manager whose stored tokens validate with every required scope and never expire.
pub(crate) async fn granted_tokens() -> (Arc<TokenManager>, Arc<FakeOAuth>, Arc<MemoryStore>) {
	let store = Arc::new(MemoryStore::default());
	let oauth = Arc::new(FakeOAuth::default());
	for kind in TokenKind::ALL {
		store
			.save_token(
				kind,
				&StoredToken {
					access_token: SecretString::new(access_of(kind)),
					refresh_token: Some(SecretString::new(format!("{kind}-refresh"))),
					expires_at: None,
				},
			)
			.await
			.expect("seed token");
		oauth.accept(&access_of(kind), kind, 0);
	}

	let tokens = TokenManager::new(oauth.clone(), store.clone(), TokenSeeds::default());
	tokens.initialize().await.expect("initialize tokens");
	(tokens, oauth, store)
}

/// Token manager with nothing stored; every kind ends up denied.
pub(crate) async fn denied_tokens() -> Arc<TokenManager> {
	let tokens = TokenManager::new(
		Arc::new(FakeOAuth::default()),
		Arc::new(MemoryStore::default()),
		TokenSeeds::default(),
	);
	tokens.initialize().await.expect("initialize tokens");
	tokens
}

pub(crate) fn redemption(reward_id: &RewardId, input: Option<&str>) -> Redemption {
	Redemption {
		id: format!("redeem-{reward_id}"),
		user: RedeemingUser {
			id: "u-1".to_string(),
			login: "alice".to_string(),
			display_name: "Alice".to_string(),
		},
		reward: RedeemedReward {
			id: reward_id.clone(),
			title: "reward".to_string(),
			cost: 100,
			is_user_input_required: input.is_some(),
		},
		user_input: input.map(str::to_string),
		redeemed_at: None,
	}
}

/// Client half of an in-memory websocket.
pub(crate) struct FakeWs {
	incoming: mpsc::UnboundedReceiver<Result<Message, WsError>>,
	sent: Arc<Mutex<Vec<Message>>>,
	broken: Arc<AtomicBool>,
}

/// Server half: push frames in, inspect what the client sent.
#[derive(Clone)]
pub(crate) struct FakeServer {
	tx: mpsc::UnboundedSender<Result<Message, WsError>>,
	sent: Arc<Mutex<Vec<Message>>>,
	broken: Arc<AtomicBool>,
}

impl FakeServer {
	pub fn push_text(&self, text: impl Into<String>) {
		let _ = self.tx.send(Ok(Message::text(text.into())));
	}

	pub fn push_close(&self) {
		let _ = self.tx.send(Ok(Message::Close(None)));
	}

	pub fn push_ping(&self) {
		let _ = self.tx.send(Ok(Message::Ping(Default::default())));
	}

	/// Every later send and close from the client fails.
	pub fn break_sink(&self) {
		self.broken.store(true, Ordering::SeqCst);
	}

	pub fn sent_texts(&self) -> Vec<String> {
		self.sent
			.lock()
			.iter()
			.filter_map(|m| match m {
				Message::Text(t) => Some(t.as_str().to_string()),
				_ => None,
			})
			.collect()
	}

	pub fn pings(&self) -> usize {
		self.sent_texts().iter().filter(|t| t.contains(r#""PING""#)).count()
	}

	pub fn saw_close(&self) -> bool {
		self.sent.lock().iter().any(|m| matches!(m, Message::Close(_)))
	}

	pub fn is_closed_by_client(&self) -> bool {
		self.tx.is_closed()
	}
}

impl Stream for FakeWs {
	type Item = Result<Message, WsError>;

	fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
		self.incoming.poll_recv(cx)
	}
}

impl Sink<Message> for FakeWs {
	type Error = WsError;

	fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
		Poll::Ready(Ok(()))
	}

	fn start_send(self: Pin<&mut Self>, item: Message) -> Result<(), Self::Error> {
		if self.broken.load(Ordering::SeqCst) {
			return Err(WsError::AlreadyClosed);
		}
		self.sent.lock().push(item);
		Ok(())
	}

	fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
		Poll::Ready(Ok(()))
	}

	fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
		if self.broken.load(Ordering::SeqCst) {
			return Poll::Ready(Err(WsError::AlreadyClosed));
		}
		Poll::Ready(Ok(()))
	}
}

/// Hands out fresh in-memory sockets and remembers their server halves.
#[derive(Clone, Default)]
pub(crate) struct FakeNet {
	servers: Arc<Mutex<Vec<FakeServer>>>,
	pub refuse: Arc<AtomicBool>,
}

impl FakeNet {
	pub fn connector(&self) -> WsConnector {
		let net = self.clone();
		Arc::new(move |_url: Url| {
			let net = net.clone();
			Box::pin(async move {
				if net.refuse.load(Ordering::SeqCst) {
					anyhow::bail!("connection refused");
				}
				let (tx, incoming) = mpsc::unbounded_channel();
				let sent = Arc::new(Mutex::new(Vec::new()));
				let broken = Arc::new(AtomicBool::new(false));
				net.servers.lock().push(FakeServer {
					tx,
					sent: Arc::clone(&sent),
					broken: Arc::clone(&broken),
				});
				Ok(Box::new(FakeWs { incoming, sent, broken }) as BoxedWs)
			}) as Pin<Box<dyn Future<Output = anyhow::Result<BoxedWs>> + Send>>
		})
	}

	pub fn connections(&self) -> usize {
		self.servers.lock().len()
	}

	pub fn server(&self, idx: usize) -> FakeServer {
		self.servers.lock()[idx].clone()
	}

	pub fn last(&self) -> FakeServer {
		self.servers.lock().last().cloned().expect("no connection was made")
	}
}

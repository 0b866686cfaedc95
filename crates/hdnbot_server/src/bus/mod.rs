#![forbid(unsafe_code)]

//! PubSub connection for channel-points redemptions.
//!
//! At most one session is live. A session is a spawned task owning the socket;
//! [`PubSubBus::restart`] tears the current one down before opening the next.

mod transport;

use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Context;
use futures::{SinkExt, StreamExt};
use hdnbot_domain::{Redemption, TokenKind};
use hdnbot_platform::TokenSource;
use hdnbot_platform::twitch::pubsub::{self, ServerFrame};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use url::Url;

pub use transport::{BoxFuture, BoxedWs, WsConnector, WsTransport, default_connector};

use crate::identity::BroadcasterIdentity;
use crate::tokens::TokenManager;
use crate::util::timer::{TimerSlot, jittered, uniform_below};


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
	Disconnected,
	Connecting,
	Subscribed,
	/// The session ended and a restart is scheduled.
	Reconnecting,
}

#[derive(Debug, Clone)]
pub struct BusConfig {
	pub url: Url,
	/// Delay before the first PING of a session.
	pub keepalive_initial: Duration,
	pub keepalive_initial_jitter: Duration,
	/// Delay between later PINGs.
	pub keepalive_period: Duration,
	pub keepalive_jitter: Duration,
	/// Upper bound of the random delay before a scheduled restart.
	pub reconnect_jitter: Duration,
	/// How long teardown waits for a session to close before aborting it.
	pub close_timeout: Duration,
}

impl BusConfig {
	pub fn new(url: Url) -> Self {
		Self {
			url,
			keepalive_initial: Duration::from_secs(280),
			keepalive_initial_jitter: Duration::from_secs(10),
			keepalive_period: Duration::from_secs(300),
			keepalive_jitter: Duration::from_secs(1),
			reconnect_jitter: Duration::from_millis(5000),
			close_timeout: Duration::from_secs(2),
		}
	}
}

/// What the session loop does with one text frame.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Routed {
	Pong,
	Reconnect,
	ListenOk { nonce: Option<String> },
	ListenFailed { nonce: Option<String>, error: String },
	Redemption(Box<Redemption>),
	Ignored { reason: String },
}

pub(crate) fn route_text(raw: &str) -> Routed {
	let frame = match pubsub::decode_server_frame(raw) {
		Ok(frame) => frame,
		Err(e) => {
			return Routed::Ignored {
				reason: format!("undecodable frame: {e:#}"),
			};
		}
	};

	match frame {
		ServerFrame::Pong => Routed::Pong,
		ServerFrame::Reconnect => Routed::Reconnect,
		ServerFrame::Response { nonce, error: None } => Routed::ListenOk { nonce },
		ServerFrame::Response {
			nonce,
			error: Some(error),
		} => Routed::ListenFailed { nonce, error },
		ServerFrame::Message { topic, message } => {
			if !pubsub::is_channel_points_topic(&topic) {
				return Routed::Ignored {
					reason: format!("unexpected topic {topic}"),
				};
			}
			match pubsub::decode_redemption(&message) {
				Ok(Some(redemption)) => Routed::Redemption(Box::new(redemption)),
				Ok(None) => Routed::Ignored {
					reason: "channel-points event is not a redemption".to_string(),
				},
				Err(e) => Routed::Ignored {
					reason: format!("undecodable redemption: {e:#}"),
				},
			}
		}
		ServerFrame::Other { kind, .. } => Routed::Ignored {
			reason: format!("unknown frame type {kind}"),
		},
	}
}

#[derive(Debug)]
enum SessionEnd {
	Requested,
	Reconnect,
	Lost(String),
}

struct Session {
	id: u64,
	close_tx: Option<oneshot::Sender<()>>,
	task: JoinHandle<()>,
}

#[derive(Default)]
struct BusInner {
	session: Option<Session>,
	next_session_id: u64,
}

pub struct PubSubBus {
	me: Weak<PubSubBus>,
	cfg: BusConfig,
	tokens: Arc<TokenManager>,
	identity: Arc<BroadcasterIdentity>,
	connector: WsConnector,
	redemptions: mpsc::Sender<Redemption>,
	inner: tokio::sync::Mutex<BusInner>,
	reconnect: parking_lot::Mutex<TimerSlot>,
	state: watch::Sender<BusState>,
}

impl PubSubBus {
	pub fn new(
		cfg: BusConfig,
		tokens: Arc<TokenManager>,
		identity: Arc<BroadcasterIdentity>,
		connector: WsConnector,
		redemptions: mpsc::Sender<Redemption>,
	) -> Arc<Self> {
		Arc::new_cyclic(|me| Self {
			me: me.clone(),
			cfg,
			tokens,
			identity,
			connector,
			redemptions,
			inner: tokio::sync::Mutex::new(BusInner::default()),
			reconnect: parking_lot::Mutex::new(TimerSlot::new()),
			state: watch::channel(BusState::Disconnected).0,
		})
	}

	pub fn state(&self) -> BusState {
		*self.state.borrow()
	}

	pub fn subscribe_state(&self) -> watch::Receiver<BusState> {
		self.state.subscribe()
	}

	pub fn reconnect_pending(&self) -> bool {
		self.reconnect.lock().is_pending()
	}

	fn set_state(&self, state: BusState) {
		let previous = self.state.send_replace(state);
		if previous != state {
			debug!(?previous, current = ?state, "pubsub state changed");
		}
	}

	/// Tear down the current session (if any) and open a new one.
	///
	/// Does nothing while the broadcaster token is unusable.
	pub async fn restart(&self) -> anyhow::Result<()> {
		let mut inner = self.inner.lock().await;

		if !self.tokens.has_capability(TokenKind::Broadcaster) {
			warn!("broadcaster token unusable; not connecting to pubsub");
			if inner.session.as_ref().is_none_or(|s| s.task.is_finished()) {
				self.set_state(BusState::Disconnected);
			}
			return Ok(());
		}

		if let Some(old) = inner.session.take() {
			self.teardown(old).await;
		}
		self.reconnect.lock().cancel();

		self.set_state(BusState::Connecting);
		inner.next_session_id += 1;
		let session_id = inner.next_session_id;

		match self.open_session(session_id).await {
			Ok(session) => {
				inner.session = Some(session);
				self.set_state(BusState::Subscribed);
				metrics::counter!("hdnbot_pubsub_sessions_total").increment(1);
				Ok(())
			}
			Err(e) => {
				self.set_state(BusState::Disconnected);
				metrics::counter!("hdnbot_pubsub_connect_failures_total").increment(1);
				Err(e)
			}
		}
	}

	async fn open_session(&self, session_id: u64) -> anyhow::Result<Session> {
		let broadcaster_id = self.identity.id().await.context("resolve broadcaster id")?;
		let token = self
			.tokens
			.access_token(TokenKind::Broadcaster)
			.context("broadcaster token became unusable")?;

		let mut ws = (self.connector)(self.cfg.url.clone())
			.await
			.with_context(|| format!("connect to {}", self.cfg.url))?;

		let topics = vec![pubsub::channel_points_topic(&broadcaster_id)];
		let nonce = uuid::Uuid::new_v4().to_string();
		let listen = pubsub::listen_frame(&nonce, &topics, token.expose())?;
		ws.send(Message::text(listen)).await.context("send LISTEN")?;

		info!(session_id, topic = %topics[0], %nonce, "pubsub session opened; LISTEN sent");

		let (close_tx, close_rx) = oneshot::channel();
		let task = tokio::spawn(run_session(SessionCtx {
			id: session_id,
			ws,
			close_rx,
			cfg: self.cfg.clone(),
			redemptions: self.redemptions.clone(),
			bus: self.me.clone(),
		}));

		Ok(Session {
			id: session_id,
			close_tx: Some(close_tx),
			task,
		})
	}

	async fn teardown(&self, mut session: Session) {
		if let Some(tx) = session.close_tx.take() {
			if tx.send(()).is_err() {
				debug!(session_id = session.id, "pubsub session already ended before close request");
			}
		}

		match tokio::time::timeout(self.cfg.close_timeout, &mut session.task).await {
			Ok(Ok(())) => debug!(session_id = session.id, "pubsub session closed"),
			Ok(Err(e)) => warn!(session_id = session.id, error = %e, "pubsub session task failed"),
			Err(_) => {
				warn!(session_id = session.id, "pubsub session did not close in time; aborting");
				session.task.abort();
			}
		}
	}

	/// Schedule one restart after a random delay below the reconnect jitter.
	fn schedule_restart(&self) {
		let delay = uniform_below(self.cfg.reconnect_jitter);
		let me = self.me.clone();
		self.reconnect.lock().arm(delay, async move {
			let Some(bus) = me.upgrade() else {
				return;
			};
			tokio::spawn(async move {
				if let Err(e) = bus.restart().await {
					error!(error = ?e, "pubsub restart failed; staying disconnected");
				}
			});
		});
		self.set_state(BusState::Reconnecting);
		metrics::counter!("hdnbot_pubsub_restarts_scheduled_total").increment(1);
		info!(delay_ms = delay.as_millis() as u64, "pubsub restart scheduled");
	}

	/// Close the session and cancel any scheduled restart.
	pub async fn shutdown(&self) {
		let mut inner = self.inner.lock().await;
		self.reconnect.lock().cancel();
		if let Some(session) = inner.session.take() {
			self.teardown(session).await;
		}
		self.reconnect.lock().cancel();
		self.set_state(BusState::Disconnected);
		info!("pubsub bus stopped");
	}
}

struct SessionCtx {
	id: u64,
	ws: BoxedWs,
	close_rx: oneshot::Receiver<()>,
	cfg: BusConfig,
	redemptions: mpsc::Sender<Redemption>,
	bus: Weak<PubSubBus>,
}

async fn run_session(ctx: SessionCtx) {
	let SessionCtx {
		id,
		mut ws,
		mut close_rx,
		cfg,
		redemptions,
		bus,
	} = ctx;

	let mut next_ping = Instant::now() + jittered(cfg.keepalive_initial, cfg.keepalive_initial_jitter);

	let end = loop {
		tokio::select! {
			_ = &mut close_rx => {
				break SessionEnd::Requested;
			}

			_ = tokio::time::sleep_until(next_ping) => {
				let frame = match pubsub::ping_frame() {
					Ok(frame) => frame,
					Err(e) => break SessionEnd::Lost(format!("{e:#}")),
				};
				if let Err(e) = ws.send(Message::text(frame)).await {
					break SessionEnd::Lost(format!("send PING: {e}"));
				}
				debug!(session_id = id, "pubsub PING sent");
				next_ping = Instant::now() + jittered(cfg.keepalive_period, cfg.keepalive_jitter);
			}

			msg = ws.next() => {
				let Some(msg) = msg else {
					break SessionEnd::Lost("stream ended".to_string());
				};
				let msg = match msg {
					Ok(m) => m,
					Err(e) => break SessionEnd::Lost(format!("read error: {e}")),
				};

				match msg {
					Message::Text(text) => match route_text(text.as_str()) {
						Routed::Pong => debug!(session_id = id, "pubsub PONG"),
						Routed::Reconnect => {
							info!(session_id = id, "pubsub asked us to reconnect");
							metrics::counter!("hdnbot_pubsub_reconnect_frames_total").increment(1);
							break SessionEnd::Reconnect;
						}
						Routed::ListenOk { nonce } => {
							info!(session_id = id, nonce = nonce.as_deref().unwrap_or("-"), "pubsub LISTEN accepted");
						}
						Routed::ListenFailed { nonce, error } => {
							error!(
								session_id = id,
								nonce = nonce.as_deref().unwrap_or("-"),
								%error,
								"pubsub LISTEN rejected"
							);
						}
						Routed::Redemption(redemption) => forward(id, &redemptions, *redemption),
						Routed::Ignored { reason } => debug!(session_id = id, %reason, "pubsub frame ignored"),
					},
					Message::Ping(payload) => {
						if let Err(e) = ws.send(Message::Pong(payload)).await {
							debug!(session_id = id, error = %e, "pubsub pong send failed");
						}
					}
					Message::Close(frame) => break SessionEnd::Lost(format!("closed by server: {frame:?}")),
					Message::Binary(_) | Message::Pong(_) | Message::Frame(_) => {}
				}
			}
		}
	};

	match end {
		SessionEnd::Requested => {
			if let Err(e) = ws.send(Message::Close(None)).await {
				debug!(session_id = id, error = %e, "pubsub close frame send failed");
			}
			if let Err(e) = ws.close().await {
				debug!(session_id = id, error = %e, "pubsub websocket close failed");
			}
			debug!(session_id = id, "pubsub session closed on request");
		}
		SessionEnd::Reconnect => {
			if let Err(e) = ws.close().await {
				debug!(session_id = id, error = %e, "pubsub websocket close failed");
			}
			if let Some(bus) = bus.upgrade() {
				bus.schedule_restart();
			}
		}
		SessionEnd::Lost(reason) => {
			warn!(session_id = id, %reason, "pubsub session lost");
			metrics::counter!("hdnbot_pubsub_sessions_lost_total").increment(1);
			if let Some(bus) = bus.upgrade() {
				bus.schedule_restart();
			}
		}
	}
}

fn forward(session_id: u64, redemptions: &mpsc::Sender<Redemption>, redemption: Redemption) {
	match redemptions.try_send(redemption) {
		Ok(()) => metrics::counter!("hdnbot_redemptions_received_total").increment(1),
		Err(mpsc::error::TrySendError::Full(r)) => {
			metrics::counter!("hdnbot_redemptions_dropped_total").increment(1);
			warn!(session_id, redemption_id = %r.id, "redemption queue full; dropping redemption");
		}
		Err(mpsc::error::TrySendError::Closed(r)) => {
			warn!(session_id, redemption_id = %r.id, "redemption dispatcher gone; dropping redemption");
		}
	}
}

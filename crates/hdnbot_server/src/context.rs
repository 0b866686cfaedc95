#![forbid(unsafe_code)]

//! Wiring of every long-lived part of the bot.

use std::sync::{Arc, Weak};
use std::time::Duration;

use hdnbot_domain::{Redemption, TokenKind};
use hdnbot_platform::{ChatSink, RewardCatalog, UserDirectory};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::admin::AdminOps;
use crate::bus::{PubSubBus, WsConnector};
use crate::config::BotConfig;
use crate::identity::BroadcasterIdentity;
use crate::registry::{ListenerRegistry, spawn_dispatcher};
use crate::rewards::{HelixChatAnnouncer, RewardControls, RewardSync};
use crate::store::Store;
use crate::tokens::{Capability, TokenManager};

/// Remote services the bot talks to.
pub struct Platform {
	pub catalog: Arc<dyn RewardCatalog>,
	pub users: Arc<dyn UserDirectory>,
	pub chat: Arc<dyn ChatSink>,
	pub connector: WsConnector,
}

pub struct BotContext {
	me: Weak<BotContext>,
	pub tokens: Arc<TokenManager>,
	pub identity: Arc<BroadcasterIdentity>,
	pub registry: Arc<ListenerRegistry>,
	pub rewards: Arc<RewardSync>,
	pub bus: Arc<PubSubBus>,
	pub admin: AdminOps,
	bot_login: Option<String>,
	redirect_uri: String,
	revalidate_interval: Duration,
	redemptions: Mutex<Option<mpsc::Receiver<Redemption>>>,
	tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BotContext {
	pub fn new(cfg: &BotConfig, store: Arc<dyn Store>, tokens: Arc<TokenManager>, platform: Platform) -> Arc<Self> {
		let identity = Arc::new(BroadcasterIdentity::new(
			cfg.twitch.channel.clone(),
			cfg.twitch.broadcaster_id.clone(),
			platform.users,
		));
		let registry = Arc::new(ListenerRegistry::new());

		let controls = Arc::new(RewardControls::new(
			platform.catalog,
			Arc::clone(&tokens),
			Arc::clone(&identity),
		));
		let announcer = Arc::new(HelixChatAnnouncer::new(platform.chat, Arc::clone(&identity)));
		let rewards = Arc::new(RewardSync::new(
			controls,
			Arc::clone(&store),
			Arc::clone(&registry),
			announcer,
			cfg.rewards,
		));

		let (tx, rx) = mpsc::channel(cfg.redemption_queue);
		let bus = PubSubBus::new(
			cfg.bus.clone(),
			Arc::clone(&tokens),
			Arc::clone(&identity),
			platform.connector,
			tx,
		);
		let admin = AdminOps::new(store, Arc::clone(&rewards), Arc::clone(&bus));

		Arc::new_cyclic(|me| Self {
			me: me.clone(),
			tokens,
			identity,
			registry,
			rewards,
			bus,
			admin,
			bot_login: cfg.twitch.bot_login.clone(),
			redirect_uri: cfg.twitch.redirect_uri.clone(),
			revalidate_interval: cfg.revalidate_interval,
			redemptions: Mutex::new(Some(rx)),
			tasks: Mutex::new(Vec::new()),
		})
	}

	/// Load and validate tokens, sync rewards, connect PubSub, and start the
	/// background tasks. A missing or rejected token leaves the dependent parts
	/// idle instead of failing.
	pub async fn start(&self) -> anyhow::Result<()> {
		self.tokens.initialize().await?;
		for kind in TokenKind::ALL {
			info!(
				%kind,
				capability = ?self.tokens.capability(kind),
				login = self.tokens.login(kind).as_deref().unwrap_or("-"),
				"token state after startup"
			);
		}

		if let Some(rx) = self.redemptions.lock().take() {
			let handle = spawn_dispatcher(Arc::clone(&self.registry), rx);
			self.tasks.lock().push(handle);
		}

		self.bring_up().await;

		if let Some(handle) = self.spawn_capability_watcher() {
			self.tasks.lock().push(handle);
		}
		let handle = self.spawn_revalidation();
		self.tasks.lock().push(handle);
		Ok(())
	}

	async fn bring_up(&self) {
		match self.rewards.resync().await {
			Ok(report) => debug!(?report, "startup resync"),
			Err(e) => warn!(error = ?e, "reward resync failed"),
		}
		if let Err(e) = self.bus.restart().await {
			warn!(error = ?e, "pubsub connect failed; staying disconnected");
		}
	}

	/// Resync and reconnect whenever the broadcaster token becomes usable.
	fn spawn_capability_watcher(&self) -> Option<JoinHandle<()>> {
		let mut rx = self.tokens.subscribe(TokenKind::Broadcaster)?;
		let me = self.me.clone();
		let mut was_granted = rx.borrow_and_update().is_granted();
		Some(tokio::spawn(async move {
			while rx.changed().await.is_ok() {
				let granted = rx.borrow_and_update().is_granted();
				if granted && !was_granted {
					let Some(ctx) = me.upgrade() else {
						break;
					};
					info!("broadcaster token usable; resyncing rewards and reconnecting pubsub");
					ctx.bring_up().await;
				}
				was_granted = granted;
			}
		}))
	}

	fn spawn_revalidation(&self) -> JoinHandle<()> {
		let tokens = Arc::clone(&self.tokens);
		let period = self.revalidate_interval;
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(period);
			ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
			ticker.tick().await;
			loop {
				ticker.tick().await;
				for kind in TokenKind::ALL {
					let capability = tokens.validate(kind).await;
					debug!(%kind, ?capability, "token revalidated");
				}
			}
		})
	}

	/// Exchange an OAuth code for a token of `kind`. The broadcaster token must
	/// belong to the channel; the chat token to the bot account when one is configured.
	pub async fn authorize(&self, kind: TokenKind, code: &str) -> anyhow::Result<Capability> {
		let expected = match kind {
			TokenKind::Chat => self.bot_login.as_deref(),
			TokenKind::Broadcaster => Some(self.identity.login()),
		};
		let capability = self
			.tokens
			.exchange_code(kind, code, &self.redirect_uri, expected)
			.await?;
		info!(%kind, ?capability, "authorization code exchanged");
		Ok(capability)
	}

	pub async fn shutdown(&self) {
		for task in self.tasks.lock().drain(..) {
			task.abort();
		}
		self.bus.shutdown().await;
		self.tokens.shutdown();
		info!("bot stopped");
	}
}

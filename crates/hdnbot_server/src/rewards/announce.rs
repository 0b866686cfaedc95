#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use hdnbot_platform::ChatSink;

use crate::identity::BroadcasterIdentity;

/// Where incentive progress is announced.
#[async_trait]
pub trait Announcer: Send + Sync {
	async fn announce(&self, text: &str) -> anyhow::Result<()>;
}

/// Posts announcements into the broadcaster's chat as the chat-token user.
pub struct HelixChatAnnouncer {
	chat: Arc<dyn ChatSink>,
	identity: Arc<BroadcasterIdentity>,
}

impl HelixChatAnnouncer {
	pub fn new(chat: Arc<dyn ChatSink>, identity: Arc<BroadcasterIdentity>) -> Self {
		Self { chat, identity }
	}
}

#[async_trait]
impl Announcer for HelixChatAnnouncer {
	async fn announce(&self, text: &str) -> anyhow::Result<()> {
		let broadcaster_id = self.identity.id().await?;
		self.chat
			.send_chat(&broadcaster_id, text)
			.await
			.with_context(|| format!("send announcement to #{}", self.identity.login()))?;
		Ok(())
	}
}

pub fn completion_message(incentive_name: &str) -> String {
	format!("The {incentive_name} incentive has been met!")
}

pub fn threshold_message(incentive_name: &str, percent: u32) -> String {
	format!("{incentive_name} is {percent}% complete! Use Channel Points to push it forward!")
}

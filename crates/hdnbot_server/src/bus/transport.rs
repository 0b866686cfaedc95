#![forbid(unsafe_code)]

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Context;
use futures::{Sink, Stream};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use url::Url;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A websocket as the session loop sees it.
pub trait WsTransport:
	Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Send + Unpin
{
}

impl<T> WsTransport for T where
	T: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Send + Unpin
{
}

pub type BoxedWs = Box<dyn WsTransport>;

pub type WsConnector = Arc<dyn Fn(Url) -> BoxFuture<'static, anyhow::Result<BoxedWs>> + Send + Sync>;

async fn connect_pubsub_ws(url: Url) -> anyhow::Result<BoxedWs> {
	let (ws, _resp) = tokio_tungstenite::connect_async(url.as_str())
		.await
		.context("connect_async to pubsub ws")?;
	Ok(Box::new(ws))
}

/// Connector that dials the real endpoint.
pub fn default_connector() -> WsConnector {
	Arc::new(|url: Url| Box::pin(connect_pubsub_ws(url)) as BoxFuture<'static, anyhow::Result<BoxedWs>>)
}

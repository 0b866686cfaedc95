#![forbid(unsafe_code)]

mod helix;
mod oauth;
pub mod pubsub;

pub use helix::HelixClient;
pub use oauth::TwitchOAuth;

pub const DEFAULT_HELIX_BASE_URL: &str = "https://api.twitch.tv";
pub const DEFAULT_OAUTH_BASE_URL: &str = "https://id.twitch.tv";
pub const DEFAULT_PUBSUB_URL: &str = "wss://pubsub-edge.twitch.tv";

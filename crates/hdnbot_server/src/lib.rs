#![forbid(unsafe_code)]

//! Channel-points bot: token lifecycle, PubSub connection, reward
//! reconciliation and redemption handling.
//!
//! The `hdnbot` binary wires these together; a chat command layer drives
//! [`admin::AdminOps`] through [`context::BotContext::admin`].

pub mod admin;
pub mod bus;
pub mod config;
pub mod context;
pub mod identity;
pub mod registry;
pub mod rewards;
pub mod store;
pub mod tokens;
pub mod util;

#[cfg(test)]
mod testutil;

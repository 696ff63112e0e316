//! Concrete channel plugins (spec.md §4.1, §6).
//!
//! Each submodule implements `registry::ChannelPlugin` for one transport
//! family. `discord` and `slack` speak their native client libraries;
//! `generic` covers Mezon, Signal, and SMS behind a shared
//! websocket/webhook shape.

pub mod discord;
pub mod generic;
pub mod slack;

pub use discord::DiscordPlugin;
pub use generic::GenericPlugin;
pub use slack::SlackPlugin;

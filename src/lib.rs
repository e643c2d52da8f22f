pub mod call;
pub mod client;
pub mod commands;
pub mod config;
pub mod error;
pub mod events;
pub mod logger;
pub mod media;
pub mod messenger;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod peer;
pub mod relay;
pub mod room;
pub mod session;
pub mod signaling;
mod utils;

pub use call::{CallManager, CallOptions, CallSnapshot, CallState, MuteState};
pub use client::{Client, ClientHandle};
pub use config::ClientConfig;
pub use error::{CallError, Result};
pub use events::{CallEvent, EventHub};
pub use messenger::{ChatMessage, Sender};

//! rustbot core
//!
//! Per-connection runtime for an IRC client bot: the wire-line parser and
//! typed message variants, the framed transport, the epoll-based readiness
//! multiplexer, per-connection server state, the user-command dispatch layer
//! with its dynamic plugin contract, and the per-thread Manager that binds
//! them into a receive -> parse -> dispatch loop.

pub mod command;
pub mod config;
pub mod epoll;
pub mod error;
pub mod manager;
pub mod message;
pub mod plugin;
pub mod server;
pub mod store;
pub mod transport;
pub mod worker;

#[cfg(test)]
mod test_util;

pub use command::{
    dispatch, invoker_permission_check, send_invoker_reply, CommandFn, UserCommand,
};
pub use config::BotConfig;
pub use epoll::{Callback, ConfigFlags, EpollManager, EventFlags, ReadyEvent, StaticEventKind};
pub use error::{Error, Result};
pub use manager::{
    process_line, tokenize_lines, Context, Manager, SignalHandler, TimerHandler,
};
pub use message::{
    is_user_source, Event, Message, MessageKind, PrivMsg, UserIdentity, COMMAND_PREFIX,
};
pub use plugin::{PluginEntryFn, PluginHandle, PluginHelpContext};
pub use server::{Channel, ChannelState, Server, ServerState};
pub use store::{Capability, CredentialStore};
pub use transport::Irc;
pub use worker::{launch_server_thread, server_thread_set, ServerThreadSet};

/// Re-exports for convenience
pub use tracing::{debug, error, info, warn};

//! Per-connection server state
//!
//! A [`Server`] is the bot's view of one IRC server connection: the
//! connection state machine, the nickname, the channel membership map, the
//! plugin registry and the plugin-registered command map. It is constructed
//! once, moved into its [`Manager`](crate::manager::Manager), and from then
//! on owned exclusively by that worker thread. The only cross-cutting pieces
//! are the atomic `state` (observable from outside for diagnostics) and the
//! command map's reader/writer lock, which lets a load/unload command mutate
//! the map while a dispatch lookup is in flight on the same thread.

use crate::command::UserCommand;
use crate::plugin::PluginHandle;
use crate::store::CredentialStore;
use crate::transport::Irc;
use crate::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::TcpStream;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU8, Ordering};
use tracing::{debug, error, info};

/// Connection lifecycle. Transitions are made by the owning Manager and are
/// monotonic except for `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerState {
    Setup = 0,
    Connected = 1,
    LoggedIn = 2,
    Failed = 3,
}

impl ServerState {
    pub fn as_str(self) -> &'static str {
        match self {
            ServerState::Setup => "Uninitialized",
            ServerState::Connected => "Connected",
            ServerState::LoggedIn => "Logged In",
            ServerState::Failed => "Failed",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => ServerState::Setup,
            1 => ServerState::Connected,
            2 => ServerState::LoggedIn,
            _ => ServerState::Failed,
        }
    }
}

/// Membership progress for one channel entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// JOIN sent, no server echo yet. Entries may sit here indefinitely if
    /// the server never confirms.
    JoinRequested,
    /// Server confirmed membership.
    Joined,
    /// PART sent; the entry is removed on the echo.
    PartRequested,
}

/// One tracked channel.
#[derive(Debug, Clone, Copy)]
pub struct Channel {
    pub state: ChannelState,
}

/// The bot's state for one server connection.
pub struct Server {
    irc: Irc,
    state: AtomicU8,
    address: String,
    port: u16,
    nickname: String,
    channels: HashMap<String, Channel>,
    user_commands: RwLock<HashMap<String, UserCommand>>,
    plugins: HashMap<String, PluginHandle>,
    store: CredentialStore,
}

impl Server {
    pub fn new(
        irc: Irc,
        address: String,
        port: u16,
        nickname: &str,
        store: CredentialStore,
    ) -> Self {
        Self {
            irc,
            state: AtomicU8::new(ServerState::Setup as u8),
            address,
            port,
            nickname: nickname.to_string(),
            channels: HashMap::new(),
            user_commands: RwLock::new(HashMap::new()),
            plugins: HashMap::new(),
            store,
        }
    }

    /// Resolve and connect. The returned Server is in `Setup` state and is
    /// meant to be moved into a Manager exactly once.
    pub fn connect(
        address: &str,
        port: u16,
        nickname: &str,
        store: CredentialStore,
    ) -> Result<Self> {
        let stream = TcpStream::connect((address, port)).map_err(|e| {
            error!("failed to create connection for {address}/{port} ({nickname}): {e}");
            Error::Transport(e.to_string())
        })?;
        Ok(Self::new(
            Irc::new(stream),
            address.to_string(),
            port,
            nickname,
            store,
        ))
    }

    // Basic API

    pub fn state(&self) -> ServerState {
        ServerState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub fn set_state(&self, state: ServerState) {
        info!(
            "state transition for server {}: {} -> {}",
            self.address,
            self.state().as_str(),
            state.as_str()
        );
        self.state.store(state as u8, Ordering::Relaxed);
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    /// The transport, for wire commands with no channel-map bookkeeping
    /// (PONG, raw sends).
    pub fn irc(&self) -> &Irc {
        &self.irc
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.irc.as_raw_fd()
    }

    pub fn login(&self, nickname: &str, password: &str) -> Result<()> {
        self.irc.login(nickname, password)
    }

    /// Log a summary of the connection: address, nickname, joined channels.
    pub fn dump_info(&self) {
        debug!("dump for server: {}/{}", self.address, self.port);
        debug!("nickname: {}", self.nickname);
        let joined: Vec<&str> = self
            .channels
            .iter()
            .filter(|(_, c)| c.state == ChannelState::Joined)
            .map(|(name, _)| name.as_str())
            .collect();
        if joined.is_empty() {
            debug!("channel(s): (none)");
        } else {
            debug!("channel(s): {}", joined.join(" "));
        }
    }

    /// Apply the authoritative rename from a wire NICK echo. Ignored with a
    /// log when `old` does not match the current nickname.
    pub fn update_nickname(&mut self, old: &str, new: &str) {
        if old == self.nickname {
            self.nickname = new.to_string();
        } else {
            error!("old nickname doesn't match current nickname, no update made");
        }
    }

    /// Ask the server for a rename. The nickname field is only updated when
    /// the echo comes back through [`Server::update_nickname`].
    pub fn set_nickname(&self, nickname: &str) {
        if let Err(e) = self.irc.nick(nickname) {
            error!("failed to initiate change to nickname {nickname}: {e}");
        }
    }

    // Channel API

    /// Send a JOIN and track the request. Re-joining a channel in any state
    /// resets its entry to `JoinRequested` without removal.
    pub fn join_channel(&mut self, channel: &str) -> Result<()> {
        self.irc.join(channel).map_err(|e| {
            error!("failed to initiate join request for channel {channel}: {e}");
            e
        })?;
        self.channels
            .entry(channel.to_string())
            .and_modify(|c| c.state = ChannelState::JoinRequested)
            .or_insert(Channel {
                state: ChannelState::JoinRequested,
            });
        Ok(())
    }

    /// Wire JOIN echo: advance a pending request to `Joined`. A late echo
    /// after a part request, or for an untracked channel, is a no-op.
    pub fn update_join_channel(&mut self, channel: &str) {
        if let Some(c) = self.channels.get_mut(channel) {
            if c.state == ChannelState::JoinRequested {
                c.state = ChannelState::Joined;
            } else {
                debug!("part has already been requested for {channel}");
            }
        }
    }

    /// Send a PART and mark the entry. Fails if the channel is untracked.
    pub fn part_channel(&mut self, channel: &str) -> Result<()> {
        let Some(c) = self.channels.get_mut(channel) else {
            error!("failed to part channel {channel}: no such channel present");
            return Err(Error::State(format!("no such channel: {channel}")));
        };
        self.irc.part(channel).map_err(|e| {
            error!("failed to initiate part request for channel {channel}: {e}");
            e
        })?;
        c.state = ChannelState::PartRequested;
        Ok(())
    }

    /// Wire PART echo: drop the entry. A no-op when a rejoin has already
    /// been requested or the channel is untracked.
    pub fn update_part_channel(&mut self, channel: &str) {
        if let Some(c) = self.channels.get(channel) {
            if c.state == ChannelState::PartRequested {
                self.channels.remove(channel);
            } else {
                debug!("rejoin has already been requested for {channel}");
            }
        }
    }

    /// PRIVMSG to a target. Membership is not checked.
    pub fn send_channel(&self, channel: &str, msg: &str) -> Result<usize> {
        self.irc.privmsg(channel, msg)
    }

    pub fn channel_state(&self, channel: &str) -> Option<ChannelState> {
        self.channels.get(channel).map(|c| c.state)
    }

    // Plugin command API

    /// Insert a plugin-registered command. Returns false when the key is
    /// already taken.
    pub fn add_plugin_command(&self, name: &str, command: UserCommand) -> bool {
        let mut commands = self.user_commands.write();
        match commands.entry(name.to_string()) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(command);
                true
            }
        }
    }

    /// Remove a plugin-registered command.
    pub fn remove_plugin_command(&self, name: &str) -> bool {
        if self.user_commands.write().remove(name).is_some() {
            true
        } else {
            error!(
                "command {name} not found, cannot remove for server {}",
                self.address
            );
            false
        }
    }

    /// Look up a plugin-registered command, copying it out so the lock is
    /// released before the handler runs.
    pub fn user_command(&self, name: &str) -> Option<UserCommand> {
        self.user_commands.read().get(name).copied()
    }

    /// The currently registered plugin-command keys, sorted.
    pub fn user_command_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.user_commands.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    // Plugin registry

    pub fn has_plugin(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    pub fn insert_plugin(&mut self, name: String, handle: PluginHandle) {
        self.plugins.insert(name, handle);
    }

    pub fn take_plugin(&mut self, name: &str) -> Option<PluginHandle> {
        self.plugins.remove(name)
    }

    /// Names of the loaded plugins, sorted.
    pub fn plugin_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.plugins.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.irc.quit("Goodbye cruel world!");
    }
}

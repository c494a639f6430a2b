//! Bot configuration

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Startup parameters for one connection worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    /// Server hostname or address
    pub address: String,
    /// Server port
    pub port: u16,
    /// Initial nickname
    pub nickname: String,
    /// NickServ password; empty means no identify step
    pub password: String,
    /// Channel joined at startup
    pub channel: String,
    /// Optional credential store file
    pub users_file: Option<PathBuf>,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            address: "irc.libera.chat".to_string(),
            port: 6667,
            nickname: "rustbot".to_string(),
            password: String::new(),
            channel: "##rustbot".to_string(),
            users_file: None,
        }
    }
}

impl BotConfig {
    /// Check the parts that would otherwise fail deep inside the worker.
    pub fn validate(&self) -> Result<()> {
        if self.address.is_empty() {
            return Err(Error::Config("server address must not be empty".to_string()));
        }
        if self.port == 0 {
            return Err(Error::Config("server port must not be zero".to_string()));
        }
        if self.nickname.is_empty() {
            return Err(Error::Config("nickname must not be empty".to_string()));
        }
        if !self.channel.starts_with(['#', '&']) {
            return Err(Error::Config(format!(
                "channel name must start with '#' or '&': {}",
                self.channel
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(BotConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_configs_rejected() {
        let mut config = BotConfig::default();
        config.nickname.clear();
        assert!(config.validate().is_err());

        let mut config = BotConfig::default();
        config.channel = "rustbot".to_string();
        assert!(config.validate().is_err());

        let mut config = BotConfig::default();
        config.port = 0;
        assert!(config.validate().is_err());

        let mut config = BotConfig::default();
        config.channel = "&lounge".to_string();
        assert!(config.validate().is_ok());
    }
}

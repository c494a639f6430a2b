//! Credential store
//!
//! Maps a user identity to a capability mask. The store is read-only from
//! the core's point of view: it is loaded once at startup from a TOML file
//! and consulted by the permission checks. Unknown identities fail closed.

use crate::message::UserIdentity;
use crate::{Error, Result};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::warn;

bitflags! {
    /// Permission bits a recognized identity may hold.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capability: u64 {
        const QUIT = 1;
        const PART = 1 << 1;
        const JOIN = 1 << 2;
        const NICK_MODIFY = 1 << 3;
        const ADMIN = 1 << 4;
    }
}

impl Capability {
    fn parse_name(name: &str) -> Result<Self> {
        match name {
            "quit" => Ok(Capability::QUIT),
            "part" => Ok(Capability::PART),
            "join" => Ok(Capability::JOIN),
            "nick" => Ok(Capability::NICK_MODIFY),
            "admin" => Ok(Capability::ADMIN),
            "all" => Ok(Capability::all()),
            _ => Err(Error::Config(format!("unknown capability: {name}"))),
        }
    }
}

/// One `[[users]]` entry in the store file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct UserEntry {
    nickname: String,
    username: String,
    hostname: String,
    capabilities: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    users: Vec<UserEntry>,
}

/// The identity -> capability-mask lookup, keyed by the canonical
/// `nick!user@host` form.
#[derive(Debug, Default)]
pub struct CredentialStore {
    users: HashMap<String, Capability>,
}

impl CredentialStore {
    /// Load the store from a TOML file. A missing file yields an empty
    /// store (every check then fails closed) with a warning.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("credential store {} not found, starting empty", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(Error::Io(e)),
        };
        let file: StoreFile = toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;

        let mut users = HashMap::new();
        for entry in file.users {
            let mut mask = Capability::empty();
            for name in &entry.capabilities {
                mask |= Capability::parse_name(name)?;
            }
            let key = format!("{}!{}@{}", entry.nickname, entry.username, entry.hostname);
            users.insert(key, mask);
        }
        Ok(Self { users })
    }

    /// A store holding exactly one identity, for wiring up tests.
    pub fn with_user(nickname: &str, username: &str, hostname: &str, mask: Capability) -> Self {
        let mut users = HashMap::new();
        users.insert(format!("{nickname}!{username}@{hostname}"), mask);
        Self { users }
    }

    /// The capability mask for an identity; empty when unrecognized.
    pub fn capability_mask(&self, identity: &UserIdentity) -> Capability {
        self.users
            .get(&identity.to_string())
            .copied()
            .unwrap_or(Capability::empty())
    }

    /// True iff the identity is recognized and holds at least one of the
    /// required bits.
    pub fn is_capable(&self, identity: &UserIdentity, required: Capability) -> bool {
        !(self.capability_mask(identity) & required).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn identity(nickname: &str, username: &str, hostname: &str) -> UserIdentity {
        UserIdentity {
            nickname: nickname.to_string(),
            username: username.to_string(),
            hostname: hostname.to_string(),
        }
    }

    #[test]
    fn test_load_and_lookup() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[[users]]
nickname = "kkd"
username = "~memxor"
hostname = "unaffiliated/kartikeya"
capabilities = ["all"]

[[users]]
nickname = "dan"
username = "~d"
hostname = "localhost"
capabilities = ["join", "part"]
"#
        )
        .unwrap();
        let store = CredentialStore::load(file.path()).unwrap();

        let admin = identity("kkd", "~memxor", "unaffiliated/kartikeya");
        assert_eq!(store.capability_mask(&admin), Capability::all());
        assert!(store.is_capable(&admin, Capability::ADMIN));

        let dan = identity("dan", "~d", "localhost");
        assert_eq!(
            store.capability_mask(&dan),
            Capability::JOIN | Capability::PART
        );
        assert!(store.is_capable(&dan, Capability::JOIN));
        assert!(!store.is_capable(&dan, Capability::QUIT));
    }

    #[test]
    fn test_unknown_identity_fails_closed() {
        let store = CredentialStore::default();
        let nobody = identity("nobody", "~n", "host");
        assert_eq!(store.capability_mask(&nobody), Capability::empty());
        assert!(!store.is_capable(&nobody, Capability::all()));
    }

    #[test]
    fn test_exact_triple_match_required() {
        let store = CredentialStore::with_user("dan", "~d", "localhost", Capability::JOIN);
        assert!(store.is_capable(&identity("dan", "~d", "localhost"), Capability::JOIN));
        assert!(!store.is_capable(&identity("dan", "~d", "elsewhere"), Capability::JOIN));
        assert!(!store.is_capable(&identity("dan", "~x", "localhost"), Capability::JOIN));
    }

    #[test]
    fn test_bad_capability_name_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[[users]]
nickname = "x"
username = "y"
hostname = "z"
capabilities = ["sudo"]
"#
        )
        .unwrap();
        assert!(CredentialStore::load(file.path()).is_err());
    }

    #[test]
    fn test_missing_file_is_empty_store() {
        let store = CredentialStore::load(Path::new("/nonexistent/users.toml")).unwrap();
        assert!(!store.is_capable(&identity("a", "b", "c"), Capability::all()));
    }
}

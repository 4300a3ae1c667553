//! Session resolver
//!
//! Precedence: explicit name > `ISO_SESSION` override > freshly generated ephemeral id.

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::naming::DEFAULT_SESSION;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::fmt;

/// Prefix of generated ephemeral session ids
pub const EPHEMERAL_PREFIX: &str = "eph-";

const TOKEN_LEN: usize = 11;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: String,
    /// Torn down after exactly one invocation
    pub ephemeral: bool,
}

impl Session {
    pub fn persistent(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ephemeral: false,
        }
    }

    pub fn default_session() -> Self {
        Self::persistent(DEFAULT_SESSION)
    }

    /// New ephemeral session with a random id
    pub fn ephemeral() -> Self {
        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(TOKEN_LEN)
            .map(|c| char::from(c).to_ascii_lowercase())
            .collect();
        Self {
            id: format!("{}{}", EPHEMERAL_PREFIX, token),
            ephemeral: true,
        }
    }

    /// Session for an explicit name; ids carrying the ephemeral prefix stay ephemeral
    pub fn from_name(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            ephemeral: id.starts_with(EPHEMERAL_PREFIX),
            id,
        }
    }

    /// Resolve the session for commands that may run ephemerally
    pub fn resolve(flag: Option<&str>, settings: &Settings) -> Self {
        match Self::explicit_name(flag, settings) {
            Some(id) => Self::from_name(id),
            None => Self::ephemeral(),
        }
    }

    /// Resolve the session for commands that need an existing, named session
    pub fn require(flag: Option<&str>, settings: &Settings) -> Result<Self> {
        Self::explicit_name(flag, settings).map(Self::from_name).ok_or_else(|| {
            Error::InvalidInput(
                "session is required - pass a session name or set ISO_SESSION".to_string(),
            )
        })
    }

    fn explicit_name(flag: Option<&str>, settings: &Settings) -> Option<String> {
        flag.filter(|s| !s.is_empty())
            .map(str::to_string)
            .or_else(|| settings.session_override.clone())
    }

    pub fn is_default(&self) -> bool {
        self.id == DEFAULT_SESSION
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_wins() {
        let settings = Settings::for_dir("/p").with_session_override("env");
        let session = Session::resolve(Some("flag"), &settings);
        assert_eq!(session, Session::persistent("flag"));
    }

    #[test]
    fn test_env_override() {
        let settings = Settings::for_dir("/p").with_session_override("env");
        assert_eq!(Session::resolve(None, &settings), Session::persistent("env"));
        assert_eq!(Session::resolve(Some(""), &settings), Session::persistent("env"));
    }

    #[test]
    fn test_ephemeral_fallback() {
        let settings = Settings::for_dir("/p");
        let a = Session::resolve(None, &settings);
        let b = Session::resolve(None, &settings);
        assert!(a.ephemeral);
        assert!(a.id.starts_with("eph-"));
        assert_eq!(a.id.len(), EPHEMERAL_PREFIX.len() + TOKEN_LEN);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_explicit_ephemeral_name() {
        let settings = Settings::for_dir("/p");
        let session = Session::resolve(Some("eph-abc123"), &settings);
        assert!(session.ephemeral);
        assert_eq!(session.id, "eph-abc123");

        let leftover = Session::require(Some("eph-abc123"), &settings).unwrap();
        assert!(leftover.ephemeral);

        let overridden = Session::resolve(None, &settings.with_session_override("eph-xyz"));
        assert!(overridden.ephemeral);
        assert!(!Session::from_name("ephemeral-ish").ephemeral);
    }

    #[test]
    fn test_require() {
        let settings = Settings::for_dir("/p");
        assert!(matches!(
            Session::require(None, &settings),
            Err(Error::InvalidInput(_))
        ));
        assert_eq!(
            Session::require(Some("dev"), &settings).unwrap(),
            Session::persistent("dev")
        );
    }
}

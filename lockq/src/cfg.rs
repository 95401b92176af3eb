//! Lock broker configuration.

use std::time::Duration;

/// Lock broker and server configuration.
///
/// In most cases the default configuration ([Cfg::default]) is fine and should be used.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Cfg {
    /// Maximum number of pending lock requests per namespace.
    ///
    /// Requests exceeding this limit are rejected immediately.
    /// By default this is unlimited.
    pub max_pending: Option<usize>,
    /// Time after which a namespace that holds no locks and no pending
    /// requests is removed.
    ///
    /// By default this is 10 seconds.
    pub idle_timeout: Duration,
    /// Token clients must present to authenticate.
    ///
    /// If this is [None], clients are authenticated without presenting a token.
    /// By default this is [None].
    pub token: Option<String>,
    /// Time after which a connection that has not authenticated is closed.
    ///
    /// By default this is 2 seconds.
    pub auth_timeout: Duration,
    /// Maximum length of a received protocol frame in bytes.
    ///
    /// By default this is 64 kB.
    /// This must be at least 64 bytes.
    pub max_frame_length: usize,
    #[doc(hidden)]
    pub _non_exhaustive: (),
}

impl Default for Cfg {
    fn default() -> Self {
        Self {
            max_pending: None,
            idle_timeout: Duration::from_secs(10),
            token: None,
            auth_timeout: Duration::from_secs(2),
            max_frame_length: 65_536,
            _non_exhaustive: (),
        }
    }
}

impl Cfg {
    /// Checks the configuration.
    ///
    /// # Panics
    /// Panics if the configuration is invalid.
    pub(crate) fn check(&self) {
        if self.idle_timeout.is_zero() {
            panic!("idle timeout must not be zero");
        }

        if self.auth_timeout.is_zero() {
            panic!("authentication timeout must not be zero");
        }

        if self.max_frame_length < 64 {
            panic!("maximum frame length must be at least 64 bytes");
        }

        if matches!(&self.token, Some(token) if token.is_empty()) {
            panic!("token must not be empty");
        }
    }
}

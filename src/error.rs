//! Error type shared by the registry gateway, the pollers and the config.

use crate::types::WaitIndex;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The registry could not be reached at all.
    #[error("connection to registry failed: {0}")]
    Connection(#[source] reqwest::Error),

    /// The registry answered, but not with something usable.
    #[error("registry error: {0}")]
    Registry(String),

    /// The registry handed back an index older than the one we hold.
    #[error("registry returned stale index {returned} (last seen {last})")]
    StaleIndex { last: WaitIndex, returned: WaitIndex },

    #[error("invalid configuration: {0}")]
    Misconfiguration(String),

    #[error("event channel closed")]
    ChannelClosed,
}

impl Error {
    /// Whether a poll loop should keep going after this error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Connection(_) | Error::Registry(_) | Error::StaleIndex { .. }
        )
    }
}

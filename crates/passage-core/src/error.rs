//! Error model for the connection pipeline.
//!
//! Every component surfaces the raw failure plus a kind discriminator;
//! callers branch on the kind (via the predicate methods), never on the
//! message text. Logging happens at the site that makes the recovery
//! decision: the router on retry, the handler on terminal errors, the
//! service on accept errors.

use std::io;

/// Pipeline error with the kind discriminators recovery sites branch on.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed input from a peer. The handler replies per protocol and
    /// closes; never retried.
    #[error("protocol: {0}")]
    Protocol(String),

    /// Authentication failed. Reply per protocol, close; never retried.
    #[error("authentication failed")]
    Auth,

    /// Transport dial or handshake failed. Marks the node and triggers a
    /// router-level retry.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Denied by bypass or policy.
    #[error("refused: {0}")]
    Refused(String),

    /// The surrounding task was canceled.
    #[error("canceled")]
    Canceled,

    /// Name resolution failed or returned nothing. Terminal for the
    /// request; no further retries.
    #[error("resolve: {0}")]
    Resolve(String),

    /// The listener was closed; the service loop exits.
    #[error("listener closed")]
    Closed,

    /// The component does not implement the requested capability.
    #[error("{0} not supported")]
    Unsupported(&'static str),

    /// Raw transport error. Treated like `Unavailable` for retry
    /// decisions.
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether a router retry with a fresh route may help.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Unavailable(_) | Error::Io(_))
    }

    /// Whether this is the listener-closed signal that ends an accept loop.
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Closed)
    }

    /// Map an elapsed timeout into the unavailable kind.
    pub fn timeout(what: &str) -> Self {
        Error::Unavailable(format!("{what} timed out"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(Error::Unavailable("dial".into()).is_retryable());
        assert!(Error::Io(io::Error::new(io::ErrorKind::ConnectionRefused, "x")).is_retryable());
        assert!(!Error::Resolve("empty".into()).is_retryable());
        assert!(!Error::Auth.is_retryable());
        assert!(!Error::Refused("bypass".into()).is_retryable());
        assert!(!Error::Canceled.is_retryable());
    }

    #[test]
    fn closed_is_terminal_for_accept_loops() {
        assert!(Error::Closed.is_closed());
        assert!(!Error::Canceled.is_closed());
    }
}

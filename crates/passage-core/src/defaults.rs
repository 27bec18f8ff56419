//! Default configuration values.
//!
//! Centralized constants referenced by plugin metadata parsing and the
//! typed configuration layer.

use std::time::Duration;

/// Read timeout on the initial handshake read in handlers.
pub const DEFAULT_HANDSHAKE_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Connect timeout a dialer applies when metadata sets none.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(15);

/// Consecutive failures before a node goes dead.
pub const DEFAULT_MAX_FAILS: u32 = 1;

/// How long a node stays dead once marked.
pub const DEFAULT_FAIL_TIMEOUT: Duration = Duration::from_secs(30);

/// Bounded queue depth for listeners that demultiplex internally.
pub const DEFAULT_ACCEPT_QUEUE_SIZE: usize = 1024;

/// Relay buffer size for stream copies.
pub const DEFAULT_RELAY_BUFFER_SIZE: usize = 32768;

/// Relay buffer size for packet copies.
pub const DEFAULT_PACKET_BUFFER_SIZE: usize = 4096;

/// Backoff after a transient accept error before retrying.
pub const ACCEPT_RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Idle eviction for UDP listener sessions.
pub const DEFAULT_UDP_SESSION_TTL: Duration = Duration::from_secs(60);

//! Protocol constants and tuning parameters.
//!
//! User-facing options live in [`crate::config::Config`]; the values here are
//! the defaults it starts from and the fixed limits the engine enforces
//! regardless of configuration.

use std::time::Duration;

// ============================================================================
// Client identification
// ============================================================================

/// Client ID prefix for peer ID generation (Azureus-style)
pub const CLIENT_PREFIX: &[u8; 8] = b"-SC0100-";

/// Client name advertised in the extension handshake (`v` key)
pub const CLIENT_VERSION: &str = "swarmcore 0.1.0";

/// User agent string for tracker requests
pub const USER_AGENT: &str = "swarmcore/0.1.0";

// ============================================================================
// Ports
// ============================================================================

/// Default BitTorrent listen port
pub const DEFAULT_PORT: u16 = 6881;

// ============================================================================
// Connection limits
// ============================================================================

/// Regular unchoke slots
pub const DEFAULT_MAX_UPLOADS: usize = 4;

/// Soft cap on outbound connections we initiate
pub const DEFAULT_MAX_INITIATE: usize = 40;

/// Hard cap used when `max_connections` is configured as 0
pub const DEFAULT_MAX_CONNECTIONS: usize = 100;

/// Process-wide cap on TCP connects that have not finished the handshake
pub const MAX_INCOMPLETE_CONNECTS: usize = 8;

/// Peer addresses accepted from a single PEX message by default
pub const DEFAULT_PEX_MAX_ADDRS: usize = 16;

/// Peer addresses we put in one outgoing PEX message
pub const PEX_MAX_PEERS_PER_MESSAGE: usize = 50;

// ============================================================================
// Block and piece sizes
// ============================================================================

/// Standard request size (16 KiB)
pub const CHUNK_SIZE: u32 = 16384;

/// Largest REQUEST length we serve
pub const MAX_SLICE_LENGTH: u32 = 131072;

/// Frames larger than this close the connection
pub const MAX_MESSAGE_SIZE: usize = 2 * 1024 * 1024;

/// Backlog above which the damping factor applies
pub const BACKLOG_SOFT_CAP: usize = 50;

/// Damping applied to oversized backlogs
pub const BACKLOG_DAMPING: f64 = 0.075;

/// Socket backlog (bytes) above which no further PIECE messages are queued
pub const UPLOAD_HIGH_WATER: usize = 2 * MAX_SLICE_LENGTH as usize;

/// Peers delivering below this rate (bytes/s) are not preferred while leeching
pub const MIN_PREFERRED_RATE: f64 = 1000.0;

// ============================================================================
// Timeouts
// ============================================================================

/// Time allowed to finish the BitTorrent handshake
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Accepted range for the handshake timeout
pub const HANDSHAKE_TIMEOUT_RANGE: (u64, u64) = (7, 30);

/// TCP connect timeout for outbound peers
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Silence from an unchoked peer before it counts as snubbing us
pub const SNUB_TIME: Duration = Duration::from_secs(30);

/// Peer inactivity before the connection is dropped
pub const PEER_TIMEOUT: Duration = Duration::from_secs(300);

/// Tracker HTTP request timeout
pub const HTTP_TRACKER_TIMEOUT: Duration = Duration::from_secs(60);

/// Bound on the shutdown join of worker tasks
pub const STOP_GRACE: Duration = Duration::from_secs(5);

// ============================================================================
// Periodic tasks
// ============================================================================

/// Choker cadence
pub const CHOKE_INTERVAL: Duration = Duration::from_secs(10);

/// Accepted range for the choker cadence
pub const CHOKE_INTERVAL_RANGE: (u64, u64) = (5, 30);

/// Optimistic unchoke rotation period
pub const ROUND_ROBIN_PERIOD: Duration = Duration::from_secs(30);

/// Super-seed HAVE dripping cadence
pub const SUPER_SEED_INTERVAL: Duration = Duration::from_secs(5);

/// Grace period before super-seeding starts releasing pieces
pub const SUPER_SEED_START_DELAY: Duration = Duration::from_secs(10);

/// Keep-alive cadence
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(120);

/// Peer inactivity scan cadence
pub const TIMEOUT_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// PEX delta cadence
pub const PEX_INTERVAL: Duration = Duration::from_secs(60);

/// Default announce interval before the tracker tells us otherwise
pub const TRACKER_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(300);

/// Retry delay when every tracker failed and none supplied `min interval`
pub const TRACKER_FAIL_WAIT: Duration = Duration::from_secs(300);

/// Re-announce window after the swarm drops to zero peers
pub const REANNOUNCE_WINDOW: (u64, u64) = (60, 300);

/// Delay before retrying queued connects when the connect quota is full
pub const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Short-term rate meter window used for streaming decisions
pub const SHORT_TERM_RATE_PERIOD: Duration = Duration::from_secs(5);

/// Tick of the background allocator
pub const ALLOC_INTERVAL: Duration = Duration::from_secs(1);

/// Refresh period of the picker's random tie-break permutation
pub const PICKER_SHUFFLE_INTERVAL: Duration = Duration::from_secs(60);

// ============================================================================
// Storage
// ============================================================================

/// Default write buffer size (MiB)
pub const DEFAULT_WRITE_BUFFER_MB: usize = 4;

/// Lowest accepted background allocation rate (MiB/s)
pub const MIN_ALLOC_RATE: f64 = 0.1;

/// Resume snapshot format version
pub const SNAPSHOT_VERSION: i64 = 1;

// ============================================================================
// Bad data accounting
// ============================================================================

/// Distinct bad pieces from one IP before it is kicked
pub const KICK_THRESHOLD: usize = 2;

/// Distinct bad pieces from one IP before it is banned
pub const BAN_THRESHOLD: usize = 3;

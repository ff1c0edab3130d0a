//! Engine configuration.
//!
//! [`Config`] carries every recognised option with its default. Front ends
//! that take `--name value` style options can feed them through
//! [`Config::set`], which parses, range-checks and clamps in one step.
//!
//! # Examples
//!
//! ```
//! use swarmcore::config::{AllocType, Config};
//!
//! let mut config = Config::default();
//! config.set("max_uploads", "6").unwrap();
//! config.set("alloc_type", "pre-allocate").unwrap();
//! config.set("choke_interval", "2").unwrap(); // clamped to 5 seconds
//!
//! assert_eq!(config.max_uploads, 6);
//! assert_eq!(config.alloc_type, AllocType::PreAllocate);
//! assert_eq!(config.choke_interval.as_secs(), 5);
//! ```

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::constants::*;

/// Errors produced while applying configuration options.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown option: {0}")]
    UnknownOption(String),

    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

/// How backing files are allocated on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllocType {
    /// Files are created sparse; pieces always live at their natural offset.
    #[default]
    Sparse,
    /// Files grow as pieces arrive; new pieces take the lowest free slot.
    Normal,
    /// Files are extended to full size before any download starts.
    PreAllocate,
    /// Like `Normal`, plus a background task zero-fills free slots.
    Background,
}

impl AllocType {
    /// Returns true if pieces may be stored away from their natural slot.
    pub fn uses_holes(self) -> bool {
        matches!(self, AllocType::Normal | AllocType::Background)
    }
}

impl FromStr for AllocType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sparse" => Ok(AllocType::Sparse),
            "normal" => Ok(AllocType::Normal),
            "pre-allocate" | "preallocate" => Ok(AllocType::PreAllocate),
            "background" => Ok(AllocType::Background),
            _ => Err(()),
        }
    }
}

/// All options recognised by the engine.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen port (0 picks an ephemeral port).
    pub port: u16,
    /// IP address advertised to the tracker.
    pub ip: Option<String>,
    /// Regular unchoke slots.
    pub max_uploads: usize,
    /// Soft cap on outbound connections.
    pub max_initiate: usize,
    /// Hard cap on all connections (0 means the internal default).
    pub max_connections: usize,
    /// Rate meter window.
    pub max_rate_period: Duration,
    /// Seed offset applied to fresh rate meters.
    pub upload_rate_fudge: Duration,
    /// Silence before an unchoked peer is considered snubbing.
    pub snub_time: Duration,
    /// Optimistic unchoke rotation period.
    pub round_robin_period: Duration,
    /// Choker cadence.
    pub choke_interval: Duration,
    /// Time allowed to finish the handshake.
    pub handshake_timeout: Duration,
    /// Peer inactivity before disconnecting.
    pub timeout: Duration,
    /// Keep-alive cadence.
    pub keepalive_interval: Duration,
    /// Peer inactivity scan cadence.
    pub timeout_check_interval: Duration,
    /// Write buffer size in MiB.
    pub write_buffer_size: usize,
    pub alloc_type: AllocType,
    /// Background allocation rate in MiB/s.
    pub alloc_rate: f64,
    /// Re-hash pieces when they are read for upload.
    pub double_check: bool,
    /// Re-read from disk (bypassing the write buffer) before each hash.
    pub triple_check: bool,
    /// Re-hash pieces the resume snapshot claims as verified.
    pub check_hashes: bool,
    /// Minutes between storage syncs (0 disables).
    pub auto_flush: u64,
    /// Reject a second connection from an IP we are already talking to.
    pub security: bool,
    /// Addresses accepted per PEX message (0 disables PEX intake).
    pub ut_pex_max_addrs_from_peer: usize,
    pub pex_interval: Duration,
    /// Announce interval used until the tracker supplies one.
    pub rerequest_interval: Duration,
    /// Below this many peers the engine asks trackers for more.
    pub min_peers: usize,
    pub numwant: usize,
    pub http_timeout: Duration,
    /// Request size used when slicing pieces.
    pub download_slice_size: u32,
    /// Largest REQUEST we serve.
    pub max_slice_length: u32,
    /// Upload cap in KiB/s (0 = unlimited).
    pub max_upload_rate: u64,
    /// Download cap in KiB/s (0 = unlimited).
    pub max_download_rate: u64,
    pub super_seeder: bool,
    /// Seeds mask a few pieces in their bitfield and send HAVEs instead.
    pub breakup_seed_bitfield: bool,
    /// Pieces picked at random before rarest-first kicks in.
    pub rarest_first_cutoff: usize,
    /// Kick and ban peers that repeatedly send corrupt data.
    pub auto_kick: bool,
    /// Score bonus (bytes/s) for peers on our /24 (0 disables).
    pub locality_bias: f64,
    /// Advertise the overlay-swarm extension.
    pub overlay_support: bool,
    /// Streaming high-priority window in pieces (0 disables streaming).
    pub stream_window: usize,
    /// Bound on the shutdown join of outstanding worker tasks.
    pub stop_grace: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            ip: None,
            max_uploads: DEFAULT_MAX_UPLOADS,
            max_initiate: DEFAULT_MAX_INITIATE,
            max_connections: 0,
            max_rate_period: Duration::from_secs(20),
            upload_rate_fudge: Duration::from_secs(5),
            snub_time: SNUB_TIME,
            round_robin_period: ROUND_ROBIN_PERIOD,
            choke_interval: CHOKE_INTERVAL,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            timeout: PEER_TIMEOUT,
            keepalive_interval: KEEPALIVE_INTERVAL,
            timeout_check_interval: TIMEOUT_CHECK_INTERVAL,
            write_buffer_size: DEFAULT_WRITE_BUFFER_MB,
            alloc_type: AllocType::Sparse,
            alloc_rate: 2.0,
            double_check: false,
            triple_check: false,
            check_hashes: false,
            auto_flush: 0,
            security: true,
            ut_pex_max_addrs_from_peer: DEFAULT_PEX_MAX_ADDRS,
            pex_interval: PEX_INTERVAL,
            rerequest_interval: TRACKER_ANNOUNCE_INTERVAL,
            min_peers: 20,
            numwant: 50,
            http_timeout: HTTP_TRACKER_TIMEOUT,
            download_slice_size: CHUNK_SIZE,
            max_slice_length: MAX_SLICE_LENGTH,
            max_upload_rate: 0,
            max_download_rate: 0,
            super_seeder: false,
            breakup_seed_bitfield: true,
            rarest_first_cutoff: 2,
            auto_kick: true,
            locality_bias: 0.0,
            overlay_support: false,
            stream_window: 0,
            stop_grace: STOP_GRACE,
        }
    }
}

impl Config {
    /// Applies a single `key = value` option.
    ///
    /// Durations are given in seconds, except `auto_flush` (minutes).
    /// Values outside a documented range are clamped rather than rejected.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = || ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        };
        let secs = || -> Result<Duration, ConfigError> {
            value
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite() && *v >= 0.0)
                .map(Duration::from_secs_f64)
                .ok_or_else(invalid)
        };
        let flag = || -> Result<bool, ConfigError> {
            match value {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(invalid()),
            }
        };

        match key {
            "port" => self.port = parse(value).ok_or_else(invalid)?,
            "ip" => self.ip = (!value.is_empty()).then(|| value.to_string()),
            "max_uploads" => self.max_uploads = parse(value).ok_or_else(invalid)?,
            "max_initiate" => self.max_initiate = parse(value).ok_or_else(invalid)?,
            "max_connections" => self.max_connections = parse(value).ok_or_else(invalid)?,
            "max_rate_period" => self.max_rate_period = secs()?,
            "upload_rate_fudge" => self.upload_rate_fudge = secs()?,
            "snub_time" => self.snub_time = secs()?,
            "round_robin_period" => self.round_robin_period = secs()?,
            "choke_interval" => self.choke_interval = secs()?,
            "handshake_timeout" => self.handshake_timeout = secs()?,
            "timeout" => self.timeout = secs()?,
            "keepalive_interval" => self.keepalive_interval = secs()?,
            "timeout_check_interval" => self.timeout_check_interval = secs()?,
            "write_buffer_size" => self.write_buffer_size = parse(value).ok_or_else(invalid)?,
            "alloc_type" => self.alloc_type = value.parse().map_err(|_| invalid())?,
            "alloc_rate" => self.alloc_rate = parse(value).ok_or_else(invalid)?,
            "double_check" => self.double_check = flag()?,
            "triple_check" => self.triple_check = flag()?,
            "check_hashes" => self.check_hashes = flag()?,
            "auto_flush" => self.auto_flush = parse(value).ok_or_else(invalid)?,
            "security" => self.security = flag()?,
            "ut_pex_max_addrs_from_peer" => {
                self.ut_pex_max_addrs_from_peer = parse(value).ok_or_else(invalid)?
            }
            "pex_interval" => self.pex_interval = secs()?,
            "rerequest_interval" => self.rerequest_interval = secs()?,
            "min_peers" => self.min_peers = parse(value).ok_or_else(invalid)?,
            "numwant" => self.numwant = parse(value).ok_or_else(invalid)?,
            "http_timeout" => self.http_timeout = secs()?,
            "download_slice_size" => {
                self.download_slice_size = parse(value).ok_or_else(invalid)?
            }
            "max_slice_length" => self.max_slice_length = parse(value).ok_or_else(invalid)?,
            "max_upload_rate" => self.max_upload_rate = parse(value).ok_or_else(invalid)?,
            "max_download_rate" => self.max_download_rate = parse(value).ok_or_else(invalid)?,
            "super_seeder" => self.super_seeder = flag()?,
            "breakup_seed_bitfield" => self.breakup_seed_bitfield = flag()?,
            "rarest_first_cutoff" => {
                self.rarest_first_cutoff = parse(value).ok_or_else(invalid)?
            }
            "auto_kick" => self.auto_kick = flag()?,
            "locality_bias" => self.locality_bias = parse(value).ok_or_else(invalid)?,
            "overlay_support" => self.overlay_support = flag()?,
            "stream_window" => self.stream_window = parse(value).ok_or_else(invalid)?,
            "stop_grace" => self.stop_grace = secs()?,
            _ => return Err(ConfigError::UnknownOption(key.to_string())),
        }

        self.normalize();
        Ok(())
    }

    /// Clamps every option into its accepted range.
    pub fn normalize(&mut self) {
        self.choke_interval = clamp_secs(self.choke_interval, CHOKE_INTERVAL_RANGE);
        self.handshake_timeout = clamp_secs(self.handshake_timeout, HANDSHAKE_TIMEOUT_RANGE);
        if self.alloc_rate < MIN_ALLOC_RATE || !self.alloc_rate.is_finite() {
            self.alloc_rate = MIN_ALLOC_RATE;
        }
        if self.max_uploads == 0 {
            self.max_uploads = 1;
        }
        if self.download_slice_size == 0 || self.download_slice_size > self.max_slice_length {
            self.download_slice_size = CHUNK_SIZE.min(self.max_slice_length.max(1));
        }
        if self.max_rate_period.is_zero() {
            self.max_rate_period = Duration::from_secs(1);
        }
        if self.locality_bias < 0.0 || !self.locality_bias.is_finite() {
            self.locality_bias = 0.0;
        }
    }

    /// The hard connection cap with the `0 = default` rule applied.
    pub fn connection_limit(&self) -> usize {
        if self.max_connections == 0 {
            DEFAULT_MAX_CONNECTIONS
        } else {
            self.max_connections
        }
    }

    /// The write buffer size in bytes.
    pub fn write_buffer_bytes(&self) -> usize {
        self.write_buffer_size * 1024 * 1024
    }

    /// The storage sync period, if enabled. At least one minute.
    pub fn flush_period(&self) -> Option<Duration> {
        (self.auto_flush > 0).then(|| Duration::from_secs(self.auto_flush.max(1) * 60))
    }
}

fn parse<T: FromStr>(value: &str) -> Option<T> {
    value.trim().parse().ok()
}

fn clamp_secs(value: Duration, (min, max): (u64, u64)) -> Duration {
    value.clamp(Duration::from_secs(min), Duration::from_secs(max))
}

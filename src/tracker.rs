//! HTTP tracker client ([BEP-3], [BEP-12], [BEP-23]).
//!
//! [`HttpTracker`] speaks to a single announce URL. [`Rerequester`] walks
//! a torrent's tracker tiers, remembers which tracker answered last and
//! how long to wait before asking again.
//!
//! [BEP-3]: http://bittorrent.org/beps/bep_0003.html
//! [BEP-12]: http://bittorrent.org/beps/bep_0012.html
//! [BEP-23]: http://bittorrent.org/beps/bep_0023.html

mod error;
mod http;
mod rerequester;
mod response;

pub use error::TrackerError;
pub use http::{AnnounceRequest, HttpTracker};
pub use rerequester::{AnnounceOutcome, Announced, Rerequester};
pub use response::{
    parse_compact_peers, parse_compact_peers6, AnnounceResponse, CompactPeer, ScrapeFile,
    ScrapeResponse, TrackerEvent,
};

#[cfg(test)]
mod tests;

use crate::constants::{BAN_THRESHOLD, KICK_THRESHOLD};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

/// Bad-data history of one address.
#[derive(Debug, Default, Clone)]
pub struct PerIpStats {
    pub numgood: usize,
    /// Distinct pieces this address was blamed for.
    pub bad: HashSet<usize>,
    last_good: Option<usize>,
}

/// What to do with an address after it was blamed for a bad piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Nothing,
    /// Disconnect it.
    Kick,
    /// Disconnect it and refuse it for the rest of the session.
    Ban,
}

/// Tracks which addresses supplied good and bad pieces.
///
/// An address blamed for [`KICK_THRESHOLD`] distinct pieces is kicked. One
/// blamed for [`BAN_THRESHOLD`] or more, and for more than one in thirty of
/// the pieces it delivered correctly, is banned.
#[derive(Debug)]
pub struct BadDataGuard {
    perip: HashMap<IpAddr, PerIpStats>,
    auto_kick: bool,
}

impl BadDataGuard {
    pub fn new(auto_kick: bool) -> Self {
        Self {
            perip: HashMap::new(),
            auto_kick,
        }
    }

    pub fn stats(&self, ip: &IpAddr) -> Option<&PerIpStats> {
        self.perip.get(ip)
    }

    /// Addresses that sent at least one bad piece.
    pub fn offenders(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.perip
            .iter()
            .filter(|(_, s)| !s.bad.is_empty())
            .map(|(ip, _)| *ip)
    }

    /// Credits `ip` with a good piece. Several chunks of the same piece
    /// count once.
    pub fn good(&mut self, ip: IpAddr, piece: usize) {
        let stats = self.perip.entry(ip).or_default();
        if stats.last_good != Some(piece) {
            stats.numgood += 1;
            stats.last_good = Some(piece);
        }
    }

    pub fn failed(&mut self, ip: IpAddr, piece: usize) -> Verdict {
        let stats = self.perip.entry(ip).or_default();
        stats.bad.insert(piece);
        if !self.auto_kick {
            return Verdict::Nothing;
        }
        let bad = stats.bad.len();
        if bad >= BAN_THRESHOLD && bad > stats.numgood / 30 {
            Verdict::Ban
        } else if bad >= KICK_THRESHOLD {
            Verdict::Kick
        } else {
            Verdict::Nothing
        }
    }
}

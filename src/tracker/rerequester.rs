use super::error::TrackerError;
use super::http::{AnnounceRequest, HttpTracker};
use super::response::AnnounceResponse;
use crate::constants::{TRACKER_FAIL_WAIT, USER_AGENT};
use crate::session::Session;
use rand::seq::SliceRandom;
use reqwest::Client;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Result of one pass over the tracker tiers.
#[derive(Debug)]
pub struct AnnounceOutcome {
    /// The tracker that answered, and what it said.
    pub success: Option<(String, AnnounceResponse)>,
    pub failures: Vec<(String, TrackerError)>,
}

/// Peers handed back by a successful announce.
#[derive(Debug)]
pub struct Announced {
    pub url: String,
    /// Shuffled.
    pub peers: Vec<SocketAddr>,
    pub complete: Option<u32>,
    pub incomplete: Option<u32>,
}

/// Announces to a tiered tracker list.
///
/// Trackers within a tier start in random order; a tracker that answers
/// moves to the front of its tier. Only one announce is in flight at a
/// time.
#[derive(Debug)]
pub struct Rerequester {
    tiers: Vec<Vec<String>>,
    client: Client,
    session: Arc<Session>,
    tracker_ids: HashMap<String, String>,
    interval: Duration,
    min_interval: Option<Duration>,
    in_flight: bool,
    last_failed: bool,
    last_success: Option<Instant>,
}

impl Rerequester {
    pub fn new(
        mut tiers: Vec<Vec<String>>,
        default_interval: Duration,
        timeout: Duration,
        session: Arc<Session>,
    ) -> Result<Self, TrackerError> {
        let mut rng = rand::rng();
        for tier in &mut tiers {
            tier.shuffle(&mut rng);
        }
        tiers.retain(|tier| !tier.is_empty());
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            tiers,
            client,
            session,
            tracker_ids: HashMap::new(),
            interval: default_interval,
            min_interval: None,
            in_flight: false,
            last_failed: false,
            last_success: None,
        })
    }

    pub fn tiers(&self) -> &[Vec<String>] {
        &self.tiers
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    /// Starts an announce unless one is already running. The returned
    /// future owns everything it needs and can be spawned.
    pub fn announce(
        &mut self,
        request: AnnounceRequest,
    ) -> Option<impl Future<Output = AnnounceOutcome> + Send + 'static> {
        if self.in_flight || self.tiers.is_empty() {
            return None;
        }
        self.in_flight = true;
        Some(self.walk(request))
    }

    /// Starts an announce even if another one is running. Used for
    /// `stopped`, which must not wait behind a slow regular announce.
    pub fn announce_now(
        &mut self,
        request: AnnounceRequest,
    ) -> impl Future<Output = AnnounceOutcome> + Send + 'static {
        self.in_flight = true;
        self.walk(request)
    }

    fn walk(&self, request: AnnounceRequest) -> impl Future<Output = AnnounceOutcome> + Send + 'static {
        let targets: Vec<(String, String, Option<String>)> = self
            .tiers
            .iter()
            .flatten()
            .map(|url| {
                (
                    url.clone(),
                    self.session.tracker_key(url),
                    self.tracker_ids.get(url).cloned(),
                )
            })
            .collect();
        let client = self.client.clone();

        async move {
            let mut failures = Vec::new();
            for (url, key, tracker_id) in targets {
                let tracker = match HttpTracker::with_client(&url, client.clone()) {
                    Ok(tracker) => tracker,
                    Err(e) => {
                        failures.push((url, e));
                        continue;
                    }
                };
                match tracker.announce(&request, &key, tracker_id.as_deref()).await {
                    Ok(response) => {
                        return AnnounceOutcome {
                            success: Some((url, response)),
                            failures,
                        }
                    }
                    Err(e) => failures.push((url, e)),
                }
            }
            AnnounceOutcome {
                success: None,
                failures,
            }
        }
    }

    /// Applies the outcome of an announce.
    pub fn finished(
        &mut self,
        outcome: AnnounceOutcome,
        now: Instant,
    ) -> Result<Announced, TrackerError> {
        self.in_flight = false;
        for (url, error) in &outcome.failures {
            warn!("tracker {} failed: {}", url, error);
        }

        let Some((url, response)) = outcome.success else {
            self.last_failed = true;
            return Err(TrackerError::AllFailed);
        };
        self.last_failed = false;
        self.last_success = Some(now);
        self.promote(&url);

        if response.interval > 0 {
            self.interval = Duration::from_secs(u64::from(response.interval));
        }
        if let Some(min) = response.min_interval {
            self.min_interval = Some(Duration::from_secs(u64::from(min)));
        }
        if let Some(id) = &response.tracker_id {
            self.tracker_ids.insert(url.clone(), id.clone());
        }
        if let Some(warning) = &response.warning_message {
            info!("tracker {} warns: {}", url, warning);
        }

        let mut peers: Vec<SocketAddr> = response.all_peers().copied().collect();
        peers.shuffle(&mut rand::rng());
        debug!("tracker {} returned {} peers", url, peers.len());

        Ok(Announced {
            url,
            peers,
            complete: response.complete,
            incomplete: response.incomplete,
        })
    }

    fn promote(&mut self, url: &str) {
        for tier in &mut self.tiers {
            if let Some(pos) = tier.iter().position(|u| u == url) {
                let tracker = tier.remove(pos);
                tier.insert(0, tracker);
                return;
            }
        }
    }

    /// Time until the next regular announce.
    pub fn next_delay(&self) -> Duration {
        if self.last_failed {
            self.min_interval.unwrap_or(TRACKER_FAIL_WAIT)
        } else {
            self.interval
        }
    }

    /// Whether a tracker answered within `window` of `now`.
    pub fn contacted_within(&self, now: Instant, window: Duration) -> bool {
        self.last_success
            .is_some_and(|at| now.saturating_duration_since(at) <= window)
    }
}

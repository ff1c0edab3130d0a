use super::error::TrackerError;
use super::response::{AnnounceResponse, ScrapeResponse, TrackerEvent};
use crate::bencode::{decode, DictReader, FromBencode};
use crate::constants::USER_AGENT;
use reqwest::Client;
use std::time::Duration;

/// Everything an announce reports about us, minus the per-tracker fields.
#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: TrackerEvent,
    pub numwant: usize,
    /// Address to advertise instead of the one the tracker sees.
    pub ip: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HttpTracker {
    client: Client,
    url: String,
}

impl HttpTracker {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, TrackerError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(TrackerError::Http)?;
        Self::with_client(url, client)
    }

    /// Shares `client`'s connection pool.
    pub fn with_client(url: &str, client: Client) -> Result<Self, TrackerError> {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(TrackerError::InvalidUrl(url.to_string()));
        }
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Builds the announce URL. `key` and `tracker_id` are per tracker.
    pub fn announce_url(
        &self,
        request: &AnnounceRequest,
        key: &str,
        tracker_id: Option<&str>,
    ) -> String {
        let separator = if self.url.contains('?') { '&' } else { '?' };
        let mut url = format!(
            "{}{}info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1&numwant={}&key={}",
            self.url,
            separator,
            url_encode(&request.info_hash),
            url_encode(&request.peer_id),
            request.port,
            request.uploaded,
            request.downloaded,
            request.left,
            request.numwant,
            url_encode(key.as_bytes()),
        );

        let event = request.event.as_str();
        if !event.is_empty() {
            url.push_str(&format!("&event={}", event));
        }
        if let Some(ip) = &request.ip {
            url.push_str(&format!("&ip={}", url_encode(ip.as_bytes())));
        }
        if let Some(id) = tracker_id {
            url.push_str(&format!("&trackerid={}", url_encode(id.as_bytes())));
        }
        url
    }

    pub async fn announce(
        &self,
        request: &AnnounceRequest,
        key: &str,
        tracker_id: Option<&str>,
    ) -> Result<AnnounceResponse, TrackerError> {
        let body = self.get(&self.announce_url(request, key, tracker_id)).await?;
        let value = decode(&body)?;
        check_failure(&value)?;
        Ok(AnnounceResponse::from_bencode(&value)?)
    }

    /// The scrape URL, if this tracker follows the `announce` naming
    /// convention.
    pub fn scrape_url(&self) -> Option<String> {
        let slash = self.url.rfind('/')?;
        let (base, last) = self.url.split_at(slash + 1);
        let rest = last.strip_prefix("announce")?;
        Some(format!("{}scrape{}", base, rest))
    }

    pub async fn scrape(&self, info_hash: &[u8; 20]) -> Result<ScrapeResponse, TrackerError> {
        let base = self
            .scrape_url()
            .ok_or_else(|| TrackerError::InvalidUrl(self.url.clone()))?;
        let separator = if base.contains('?') { '&' } else { '?' };
        let url = format!("{}{}info_hash={}", base, separator, url_encode(info_hash));
        let body = self.get(&url).await?;
        let value = decode(&body)?;
        check_failure(&value)?;
        Ok(ScrapeResponse::from_bencode(&value)?)
    }

    async fn get(&self, url: &str) -> Result<bytes::Bytes, TrackerError> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(TrackerError::Status(response.status().as_u16()));
        }
        Ok(response.bytes().await?)
    }
}

fn check_failure(value: &crate::bencode::Value) -> Result<(), TrackerError> {
    let dict = DictReader::new(value, "tracker response")?;
    match dict.opt_bytes("failure reason")? {
        Some(reason) => Err(TrackerError::TrackerError(
            String::from_utf8_lossy(reason).into_owned(),
        )),
        None => Ok(()),
    }
}

fn url_encode(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| {
            if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.' || b == b'~' {
                format!("{}", b as char)
            } else {
                format!("%{:02X}", b)
            }
        })
        .collect()
}

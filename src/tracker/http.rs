//! HTTP(S) tracker client.
//!
//! Builds announce and scrape GET requests and performs them with
//! `reqwest`. The response body is bencoded; decoding is delegated to
//! the session's codec through [`ResponseDecoder`], since the variant
//! serializer lives outside this crate.

use std::time::Duration;

use reqwest::Client;
use tracing::debug;

use crate::constants::{HTTP_TRACKER_TIMEOUT, USER_AGENT};
use crate::torrent::InfoHash;
use crate::tracker::error::TrackerError;
use crate::tracker::response::{
    AnnounceRequest, AnnounceResponse, ScrapeRequest, ScrapeResponse,
};

/// Decodes bencoded tracker response bodies.
///
/// A body carrying a `failure reason` should come back as
/// [`TrackerError::TrackerRejected`] with that reason as the message.
pub trait ResponseDecoder: Send + Sync {
    fn decode_announce(&self, body: &[u8]) -> Result<AnnounceResponse, TrackerError>;

    /// `requested` lists the info-hashes of the scrape, in order, so the
    /// decoder can label the `files` dictionary rows.
    fn decode_scrape(
        &self,
        body: &[u8],
        requested: &[InfoHash],
    ) -> Result<ScrapeResponse, TrackerError>;
}

pub struct HttpTracker<D> {
    client: Client,
    decoder: D,
}

impl<D: ResponseDecoder> HttpTracker<D> {
    pub fn new(decoder: D) -> Result<Self, TrackerError> {
        let client = Client::builder()
            .timeout(HTTP_TRACKER_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .map_err(TrackerError::Http)?;
        Ok(Self { client, decoder })
    }

    pub fn with_timeout(decoder: D, timeout: Duration) -> Result<Self, TrackerError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(TrackerError::Http)?;
        Ok(Self { client, decoder })
    }

    pub async fn announce(
        &self,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse, TrackerError> {
        let url = announce_url(request)?;
        debug!(target: "tracker", %url, "http announce");
        let body = self.fetch(&url).await?;
        self.decoder.decode_announce(&body)
    }

    pub async fn scrape(&self, request: &ScrapeRequest) -> Result<ScrapeResponse, TrackerError> {
        let url = scrape_url(request)?;
        debug!(target: "tracker", %url, "http scrape");
        let body = self.fetch(&url).await?;
        self.decoder.decode_scrape(&body, &request.info_hashes)
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>, TrackerError> {
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                TrackerError::Timeout
            } else if e.is_connect() {
                TrackerError::ConnectionFailed
            } else {
                TrackerError::Http(e)
            }
        })?;

        let status = response.status();
        let body = response.bytes().await.map_err(TrackerError::Http)?;
        if !status.is_success() {
            // Keep the reason text: the announcer sniffs it for the
            // "request too long" multiscrape signal.
            let reason = status.canonical_reason().unwrap_or("HTTP error");
            let text = String::from_utf8_lossy(&body);
            return Err(TrackerError::TrackerRejected(format!(
                "{reason}: {}",
                text.trim()
            )));
        }
        Ok(body.to_vec())
    }
}

fn announce_url(request: &AnnounceRequest) -> Result<String, TrackerError> {
    if !request.url.starts_with("http://") && !request.url.starts_with("https://") {
        return Err(TrackerError::InvalidUrl(request.url.clone()));
    }
    let sep = if request.url.contains('?') { '&' } else { '?' };
    let mut url = format!(
        "{}{}info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&corrupt={}&left={}&key={:08x}&numwant={}&compact=1",
        request.url,
        sep,
        url_encode(request.info_hash.as_bytes()),
        url_encode(&request.peer_id.0),
        request.port,
        request.uploaded,
        request.downloaded,
        request.corrupt,
        request.left,
        request.key,
        request.numwant,
    );
    let event = request.event.as_str();
    if !event.is_empty() {
        url.push_str("&event=");
        url.push_str(event);
    }
    if let Some(tracker_id) = &request.tracker_id {
        url.push_str("&trackerid=");
        url.push_str(&url_encode(tracker_id.as_bytes()));
    }
    Ok(url)
}

fn scrape_url(request: &ScrapeRequest) -> Result<String, TrackerError> {
    if !request.url.starts_with("http://") && !request.url.starts_with("https://") {
        return Err(TrackerError::InvalidUrl(request.url.clone()));
    }
    let mut url = request.url.clone();
    let mut sep = if url.contains('?') { '&' } else { '?' };
    for info_hash in &request.info_hashes {
        url.push(sep);
        url.push_str("info_hash=");
        url.push_str(&url_encode(info_hash.as_bytes()));
        sep = '&';
    }
    Ok(url)
}

fn url_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for &b in bytes {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

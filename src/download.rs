//! Streaming downloads through the media proxy, with progress reporting.

use crate::assets::AssetKind;
use crate::error::{Error, Result};
use futures_util::StreamExt;
use reqwest::{Client, RequestBuilder};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::AsyncWriteExt;
use url::Url;

pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/128.0.0.0 Safari/537.36";
pub const DEFAULT_REFERER: &str = "https://www.xiaohongshu.com/";

/// Bytes added to the running total when the server sends no length.
const UNKNOWN_LENGTH_PAD: u64 = 1_000_000;

/// Where media and thumbnails are fetched from.
#[derive(Debug, Clone)]
pub struct ProxyEndpoints {
    pub download_url: Option<String>,
    pub image_url: Option<String>,
    pub user_agent: String,
    pub referer: String,
}

impl Default for ProxyEndpoints {
    fn default() -> Self {
        Self {
            download_url: None,
            image_url: None,
            user_agent: BROWSER_USER_AGENT.to_string(),
            referer: DEFAULT_REFERER.to_string(),
        }
    }
}

impl ProxyEndpoints {
    fn base(&self, kind: AssetKind) -> Option<&str> {
        match kind {
            AssetKind::Video => self.download_url.as_deref(),
            AssetKind::Thumbnail => self.image_url.as_deref(),
        }
    }

    /// URL to fetch `target` from: the proxy when configured, else `target`.
    pub fn proxied_url(&self, kind: AssetKind, target: &str) -> String {
        let Some(base) = self.base(kind) else {
            return target.to_string();
        };
        match Url::parse(base) {
            Ok(mut url) => {
                url.query_pairs_mut().append_pair(kind.query_param(), target);
                url.to_string()
            }
            Err(_) => format!(
                "{}?{}={}",
                base,
                kind.query_param(),
                urlencoding::encode(target)
            ),
        }
    }

    pub fn thumbnail_url(&self, target: &str) -> String {
        self.proxied_url(AssetKind::Thumbnail, target)
    }

    /// GET request for `target`. Direct fetches carry the headers the proxy
    /// would otherwise add.
    pub fn request(&self, client: &Client, kind: AssetKind, target: &str) -> RequestBuilder {
        let url = self.proxied_url(kind, target);
        let request = client.get(url);
        if self.base(kind).is_some() {
            request
        } else {
            request
                .header(reqwest::header::USER_AGENT, &self.user_agent)
                .header(reqwest::header::REFERER, &self.referer)
                .header(reqwest::header::ACCEPT, "*/*")
        }
    }
}

/// Turns byte counts into rate-limited percentage reports.
#[derive(Debug)]
pub struct ProgressTracker {
    /// Expected length; `None` when the server did not send one.
    total: Option<u64>,
    written: u64,
    /// Whole percentage of the last report.
    last_whole: Option<u32>,
}

impl ProgressTracker {
    /// Tracker for a body of `total` bytes. A zero total counts as unknown.
    pub fn new(total: Option<u64>) -> Self {
        Self {
            total: total.filter(|&t| t > 0),
            written: 0,
            last_whole: None,
        }
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Current percentage. Without a known total this is an estimate that
    /// grows with every byte but stays below 100.
    pub fn percent(&self) -> f64 {
        let written = self.written as f64;
        match self.total {
            Some(total) => (written / total as f64 * 100.0).min(100.0),
            None => written / (written + UNKNOWN_LENGTH_PAD as f64) * 100.0,
        }
    }

    /// Record `bytes` more; yields a report when the whole percentage rises.
    pub fn advance(&mut self, bytes: u64) -> Option<f64> {
        self.written += bytes;
        let percent = self.percent();
        let whole = percent.floor() as u32;
        if self.last_whole.is_some_and(|last| whole <= last) {
            return None;
        }
        self.last_whole = Some(whole);
        Some(percent)
    }

    /// Final 100% report, unless it was already sent.
    pub fn finish(&mut self) -> Option<f64> {
        if self.last_whole == Some(100) {
            return None;
        }
        self.last_whole = Some(100);
        Some(100.0)
    }
}

/// Stream the response of `request` into `dest`, returning the byte count.
///
/// `dest` is left behind on failure; the caller owns cleanup.
pub async fn stream_to_file(
    request: RequestBuilder,
    dest: &Path,
    on_progress: &mut (dyn FnMut(f64) + Send),
    cancel: Option<&AtomicBool>,
) -> Result<u64> {
    let response = request.send().await.map_err(Error::download)?;

    let status = response.status();
    if !status.is_success() {
        match status.as_u16() {
            403 => tracing::warn!("Access forbidden, the server may be blocking the request"),
            404 => tracing::warn!("Video not found, the URL may be stale"),
            _ => {}
        }
        return Err(Error::download(format!("HTTP {}", status)));
    }

    let expected = response.content_length();
    let mut tracker = ProgressTracker::new(expected);
    let mut file = tokio::fs::File::create(dest).await?;
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        if cancel.is_some_and(|c| c.load(Ordering::Relaxed)) {
            return Err(Error::download("cancelled"));
        }
        let chunk = chunk.map_err(Error::download)?;
        file.write_all(&chunk).await?;
        if let Some(percent) = tracker.advance(chunk.len() as u64) {
            on_progress(percent);
        }
    }

    file.flush().await?;
    drop(file);

    let written = tracker.written();
    if let Some(expected) = expected {
        if written < expected {
            return Err(Error::download(format!(
                "connection closed after {} of {} bytes",
                written, expected
            )));
        }
    }
    if written == 0 {
        return Err(Error::download("empty response body"));
    }

    if let Some(percent) = tracker.finish() {
        on_progress(percent);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CannedResponse, TestServer};

    #[test]
    fn proxied_url_encodes_target() {
        let endpoints = ProxyEndpoints {
            download_url: Some("https://fn.example/functions/v1/proxyDownload".into()),
            ..Default::default()
        };
        let url = endpoints.proxied_url(AssetKind::Video, "https://cdn.example/a.mp4?sign=x&t=1");
        assert_eq!(
            url,
            "https://fn.example/functions/v1/proxyDownload?videoUrl=https%3A%2F%2Fcdn.example%2Fa.mp4%3Fsign%3Dx%26t%3D1"
        );
        // No image proxy configured.
        assert_eq!(endpoints.thumbnail_url("https://cdn.example/a.jpg"), "https://cdn.example/a.jpg");
    }

    #[test]
    fn known_total_reports_whole_points() {
        let mut tracker = ProgressTracker::new(Some(1000));
        assert!(tracker.advance(5).is_some());
        assert_eq!(tracker.advance(4), None);
        assert!(tracker.advance(10).is_some());
        assert_eq!(tracker.advance(981), Some(100.0));
        assert_eq!(tracker.finish(), None);
    }

    #[test]
    fn unknown_total_stays_below_hundred() {
        let mut tracker = ProgressTracker::new(None);
        let mut reports = Vec::new();
        for _ in 0..2000 {
            if let Some(p) = tracker.advance(64 * 1024) {
                reports.push(p);
            }
        }
        assert!(reports.windows(2).all(|w| w[0] <= w[1]));
        assert!(reports.iter().all(|&p| p < 100.0));
        let mut wholes: Vec<u32> = reports.iter().map(|p| p.floor() as u32).collect();
        let before = wholes.len();
        wholes.dedup();
        assert_eq!(wholes.len(), before, "more than one report per percentage point");
        assert_eq!(tracker.finish(), Some(100.0));
    }

    #[tokio::test]
    async fn stream_reports_to_hundred() {
        let body = vec![7u8; 10 * 1024 * 1024];
        let server = TestServer::start(vec![CannedResponse::ok(body)]).await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("1.mp4");

        let mut reports = Vec::new();
        let written = stream_to_file(
            Client::new().get(server.url("/v.mp4")),
            &dest,
            &mut |p| reports.push(p),
            None,
        )
        .await
        .unwrap();

        assert_eq!(written, 10 * 1024 * 1024);
        assert!(reports.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(reports.last().copied(), Some(100.0));
    }

    #[tokio::test]
    async fn truncated_body_is_an_error() {
        let server =
            TestServer::start(vec![CannedResponse::ok(vec![1u8; 100_000]).cut_after(10_000)]).await;
        let dir = tempfile::tempdir().unwrap();
        let err = stream_to_file(
            Client::new().get(server.url("/v.mp4")),
            &dir.path().join("x"),
            &mut |_| {},
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::DownloadFailed(_)));
    }

    #[tokio::test]
    async fn cancelled_download_stops() {
        let server = TestServer::start(vec![CannedResponse::ok(vec![1u8; 1024 * 1024])]).await;
        let dir = tempfile::tempdir().unwrap();
        let cancel = AtomicBool::new(true);
        let err = stream_to_file(
            Client::new().get(server.url("/v.mp4")),
            &dir.path().join("x"),
            &mut |_| {},
            Some(&cancel),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::DownloadFailed(ref m) if m == "cancelled"));
    }
}

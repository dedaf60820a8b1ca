//! Media relay endpoint.
//!
//! Fetches third-party media server-side with browser-like headers and a
//! referrer, then streams it back to the client as an attachment.

use crate::assets::AssetKind;
use actix_web::http::{header, StatusCode};
use actix_web::{get, web, App, HttpResponse, HttpServer};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{error, info};

/// Shared by every request: the upstream client and the browser identity
/// it presents.
pub struct ProxyState {
    client: reqwest::Client,
    /// Sent as `User-Agent` upstream.
    user_agent: String,
    /// Sent as `Referer`; media hosts reject requests without it.
    referer: String,
}

impl ProxyState {
    pub fn new(client: reqwest::Client, user_agent: &str, referer: &str) -> Self {
        Self {
            client,
            user_agent: user_agent.to_string(),
            referer: referer.to_string(),
        }
    }

    /// GET `target` with browser-like headers.
    async fn fetch(&self, kind: AssetKind, target: &str) -> reqwest::Result<reqwest::Response> {
        let accept = match kind {
            AssetKind::Video => "*/*",
            AssetKind::Thumbnail => "image/avif,image/webp,image/apng,image/*,*/*;q=0.8",
        };
        self.client
            .get(target)
            .header(reqwest::header::USER_AGENT, &self.user_agent)
            .header(reqwest::header::REFERER, &self.referer)
            .header(reqwest::header::ACCEPT, accept)
            .header(reqwest::header::CACHE_CONTROL, "no-cache")
            .send()
            .await
    }
}

#[derive(Deserialize)]
struct VideoParams {
    #[serde(rename = "videoUrl")]
    video_url: Option<String>,
}

#[derive(Deserialize)]
struct ImageParams {
    #[serde(rename = "imageUrl")]
    image_url: Option<String>,
}

fn error_body(status: StatusCode, message: &str) -> HttpResponse {
    HttpResponse::build(status).json(serde_json::json!({ "error": message }))
}

#[get("/proxyDownload")]
async fn proxy_download(
    state: web::Data<ProxyState>,
    params: web::Query<VideoParams>,
) -> HttpResponse {
    relay(&state, AssetKind::Video, params.into_inner().video_url).await
}

#[get("/proxyImageDownload")]
async fn proxy_image_download(
    state: web::Data<ProxyState>,
    params: web::Query<ImageParams>,
) -> HttpResponse {
    relay(&state, AssetKind::Thumbnail, params.into_inner().image_url).await
}

/// Fetch `target` and stream it back as an attachment.
async fn relay(state: &ProxyState, kind: AssetKind, target: Option<String>) -> HttpResponse {
    let Some(target) = target.filter(|t| !t.trim().is_empty()) else {
        return error_body(
            StatusCode::BAD_REQUEST,
            &format!("No {} URL provided", kind.as_str()),
        );
    };

    let upstream = match state.fetch(kind, &target).await {
        Ok(res) => res,
        Err(e) => {
            error!("Error fetching {}: {}", kind.as_str(), e);
            return error_body(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error");
        }
    };

    if !upstream.status().is_success() {
        let status =
            StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
        info!("Upstream returned {} for {}", status, target);
        return error_body(status, &format!("Failed to download {}", kind.as_str()));
    }

    let content_type = match kind {
        AssetKind::Video => kind.content_type().to_string(),
        AssetKind::Thumbnail => upstream
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(kind.content_type())
            .to_string(),
    };

    let mut response = HttpResponse::Ok();
    response.content_type(content_type).insert_header((
        header::CONTENT_DISPOSITION,
        format!("attachment; filename=\"{}\"", kind.attachment_name()),
    ));
    if let Some(length) = upstream.content_length() {
        response.no_chunking(length);
    }
    response.streaming(upstream.bytes_stream())
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(proxy_download).service(proxy_image_download);
}

pub async fn run_proxy_server(
    addr: SocketAddr,
    state: ProxyState,
    shutdown_signal: Arc<Notify>,
) -> std::io::Result<()> {
    let state = web::Data::new(state);
    let server = HttpServer::new(move || App::new().app_data(state.clone()).configure(configure))
        .bind(addr)?;

    info!("Starting media proxy on: {addr}");

    let server_handle = server.run();

    tokio::select! {
        result = server_handle => result,
        _ = shutdown_signal.notified() => {
            info!("Shutdown signal received, stopping media proxy");
            Ok(())
        }
    }
}

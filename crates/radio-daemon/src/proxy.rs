/// Local relay for stream origins that cannot be played directly.
///
/// Serves `GET /relay?url=<percent-encoded upstream>` on the proxy port
/// (default 8990).  The engine rewrites URLs of configured domains to this
/// endpoint.  Each request opens **one** upstream connection and streams the
/// bytes straight through, forwarding Content-Type, Transfer-Encoding and the
/// ICY-* headers so the decoder sees the stream as if it had connected
/// directly.
///
/// If the client drops its connection the upstream fetch is dropped with it.
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::StreamExt;
use reqwest::{Client, Url};
use serde::Deserialize;
use tokio_util::io::ReaderStream;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

#[derive(Clone)]
pub struct ProxyState {
    pub client: Client,
}

impl ProxyState {
    pub fn new() -> anyhow::Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        // many Icecast servers only send metadata when asked
        headers.insert("Icy-MetaData", HeaderValue::from_static("1"));
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .default_headers(headers)
            .build()?;
        Ok(Self { client })
    }
}

#[derive(Debug, Deserialize)]
pub struct RelayParams {
    url: Option<String>,
}

/// The upstream URL of a relay request, or why it cannot be used.
pub fn relay_target(raw: Option<&str>) -> Result<Url, &'static str> {
    let raw = raw.map(str::trim).filter(|s| !s.is_empty()).ok_or("missing url")?;
    let url = Url::parse(raw).map_err(|_| "invalid url")?;
    match url.scheme() {
        "http" | "https" if url.host_str().is_some() => Ok(url),
        _ => Err("unsupported url"),
    }
}

/// Whether an upstream response header is passed on to the client.
pub fn forwarded_header(name: &str) -> bool {
    name.starts_with("icy-") || name == "content-type" || name == "transfer-encoding"
}

fn status(code: StatusCode, reason: &str) -> Response {
    (code, reason.to_string()).into_response()
}

async fn relay(Query(params): Query<RelayParams>, State(state): State<ProxyState>) -> Response {
    let url = match relay_target(params.url.as_deref()) {
        Ok(url) => url,
        Err(reason) => {
            warn!("proxy: rejected relay request: {}", reason);
            return status(StatusCode::BAD_REQUEST, reason);
        }
    };

    info!("proxy: opening upstream {}", url);

    let upstream = match state.client.get(url.clone()).send().await {
        Ok(r) => r,
        Err(e) => {
            warn!("proxy: upstream connect failed for {}: {}", url, e);
            return status(StatusCode::BAD_GATEWAY, "upstream unreachable");
        }
    };

    let upstream_status = upstream.status();
    if !upstream_status.is_success() {
        warn!("proxy: upstream returned {} for {}", upstream_status, url);
        return status(StatusCode::BAD_GATEWAY, "upstream error");
    }

    let mut builder = Response::builder().status(StatusCode::OK);
    for (name, value) in upstream.headers() {
        if forwarded_header(name.as_str()) {
            if let Ok(hv) = HeaderValue::from_bytes(value.as_bytes()) {
                builder = builder.header(name.as_str(), hv);
            }
        }
    }

    let reader = tokio_util::io::StreamReader::new(
        upstream
            .bytes_stream()
            .map(|result| result.map_err(std::io::Error::other)),
    );
    let body = Body::from_stream(ReaderStream::new(reader));

    builder.body(body).unwrap_or_else(|e| {
        warn!("proxy: failed to build response: {}", e);
        status(StatusCode::BAD_GATEWAY, "bad upstream headers")
    })
}

pub fn router(state: ProxyState) -> Router {
    Router::new()
        .route("/relay", get(relay))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub fn start_server(bind_address: String, port: u16) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let state = match ProxyState::new() {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to build relay HTTP client: {}", e);
                return;
            }
        };
        let addr = format!("{}:{}", bind_address, port);
        let listener = match tokio::net::TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                warn!("Failed to bind stream proxy on {}: {}", addr, e);
                return;
            }
        };
        info!("Stream proxy listening on http://{}", addr);
        if let Err(e) = axum::serve(listener, router(state)).await {
            warn!("Stream proxy error: {}", e);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_target_validation() {
        assert_eq!(relay_target(None), Err("missing url"));
        assert_eq!(relay_target(Some("  ")), Err("missing url"));
        assert_eq!(relay_target(Some("not a url")), Err("invalid url"));
        assert_eq!(relay_target(Some("file:///etc/passwd")), Err("unsupported url"));

        let url = relay_target(Some("https://stream.example.com/live?x=1")).unwrap();
        assert_eq!(url.host_str(), Some("stream.example.com"));
        assert_eq!(url.query(), Some("x=1"));
    }

    #[test]
    fn test_forwarded_headers() {
        assert!(forwarded_header("content-type"));
        assert!(forwarded_header("icy-metaint"));
        assert!(forwarded_header("transfer-encoding"));
        assert!(!forwarded_header("connection"));
        assert!(!forwarded_header("set-cookie"));
    }
}

//! HTTP server hosting the WebSocket upgrade endpoint.
//!
//! Routes `GET /ws/{host}/{port}` into a [`BridgeSession`]; everything else
//! is answered inline. Each accepted connection runs on its own task, and
//! sessions share no state with one another.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{CONTENT_TYPE, ORIGIN};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::bridge::{BridgeConfig, BridgeSession};
use crate::target::{self, Target};

/// Server-side policy applied before a session is admitted.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    /// Origin hosts allowed to open a channel. `None` admits every origin;
    /// with a list configured, a request without an `Origin` header is
    /// refused too.
    pub allowed_origins: Option<Vec<String>>,
    /// Refuse targets naming the bridge machine or its private networks.
    pub deny_local_targets: bool,
    /// Session tunables handed to every bridge.
    pub bridge: BridgeConfig,
}

/// Listening bridge server.
pub struct BridgeServer {
    listener: TcpListener,
    config: Arc<ServerConfig>,
}

impl BridgeServer {
    /// Bind the listen socket without starting to accept.
    pub async fn bind(addr: SocketAddr, config: ServerConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            config: Arc::new(config),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept loop; runs until the process ends.
    pub async fn serve(self) -> std::io::Result<()> {
        self.serve_until(std::future::pending()).await
    }

    /// Accept loop that stops when `shutdown` resolves. In-flight sessions
    /// run to completion on their own tasks; only accepting stops.
    pub async fn serve_until<F>(self, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()>,
    {
        info!(addr = %self.listener.local_addr()?, "listening");
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted?;
                    let config = Arc::clone(&self.config);
                    tokio::spawn(async move {
                        if let Err(error) = serve_connection(stream, config).await {
                            debug!(%peer, %error, "connection ended with error");
                        }
                    });
                }
                _ = &mut shutdown => {
                    info!("shutting down");
                    return Ok(());
                }
            }
        }
    }
}

async fn serve_connection(stream: TcpStream, config: Arc<ServerConfig>) -> hyper::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |request| handle_request(request, Arc::clone(&config)));
    hyper::server::conn::http1::Builder::new()
        .serve_connection(io, service)
        .with_upgrades()
        .await
}

async fn handle_request(
    mut request: Request<Incoming>,
    config: Arc<ServerConfig>,
) -> Result<Response<Full<Bytes>>, hyper::http::Error> {
    let target = match route(request.uri().path()) {
        Route::Bridge(target) => target,
        Route::BadRequest => return text_response(StatusCode::BAD_REQUEST, "bad request"),
        Route::NotFound => return text_response(StatusCode::NOT_FOUND, "not found"),
    };

    if !origin_allowed(&request, config.allowed_origins.as_deref()) {
        warn!(remote = %target, "refusing disallowed origin");
        return text_response(StatusCode::FORBIDDEN, "not allowed");
    }

    if config.deny_local_targets && target::is_local_host(target.host()) {
        warn!(remote = %target, "refusing local target");
        return text_response(StatusCode::FORBIDDEN, "not allowed");
    }

    if !hyper_tungstenite::is_upgrade_request(&request) {
        // Plain request on the bridge route; answer like a health probe.
        return text_response(StatusCode::OK, "OK");
    }

    match hyper_tungstenite::upgrade(&mut request, None) {
        Ok((response, websocket)) => {
            info!(remote = %target, "channel opened");
            let bridge = config.bridge.clone();
            tokio::spawn(async move {
                match websocket.await {
                    Ok(ws) => BridgeSession::new(target, bridge).run(ws).await,
                    Err(error) => debug!(%error, "websocket handshake failed"),
                }
            });
            Ok(response)
        }
        Err(error) => {
            debug!(%error, "rejecting malformed upgrade");
            text_response(StatusCode::BAD_REQUEST, "bad request")
        }
    }
}

enum Route {
    Bridge(Target),
    BadRequest,
    NotFound,
}

/// Match `/ws/{host}/{port}`. A recognized prefix with missing or extra
/// segments is a bad request rather than an unknown path.
fn route(path: &str) -> Route {
    let mut segments = path.trim_start_matches('/').split('/');
    if segments.next() != Some("ws") {
        return Route::NotFound;
    }
    match (segments.next(), segments.next(), segments.next()) {
        (Some(host), Some(port), None) if !host.is_empty() && !port.is_empty() => {
            Route::Bridge(Target::new(host, port))
        }
        _ => Route::BadRequest,
    }
}

/// Origin allowlist check. Scheme and port are ignored; only the host
/// component of the `Origin` value is compared, case-insensitively.
fn origin_allowed(request: &Request<Incoming>, allowed: Option<&[String]>) -> bool {
    let Some(allowed) = allowed else {
        return true;
    };
    let origin = request
        .headers()
        .get(ORIGIN)
        .and_then(|value| value.to_str().ok());
    match origin.and_then(origin_host) {
        Some(host) => allowed.iter().any(|entry| entry.eq_ignore_ascii_case(host)),
        None => false,
    }
}

/// Extract the host from an Origin value (`scheme://host[:port]`).
fn origin_host(origin: &str) -> Option<&str> {
    let rest = origin.split_once("://").map_or(origin, |(_, rest)| rest);
    let rest = rest.split('/').next().unwrap_or(rest);
    let host = match rest.rfind(':') {
        Some(idx)
            if !rest[idx + 1..].is_empty()
                && rest[idx + 1..].bytes().all(|b| b.is_ascii_digit()) =>
        {
            &rest[..idx]
        }
        _ => rest,
    };
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    (!host.is_empty()).then_some(host)
}

fn text_response(
    status: StatusCode,
    body: &'static str,
) -> Result<Response<Full<Bytes>>, hyper::http::Error> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, mime::TEXT_PLAIN_UTF_8.as_ref())
        .body(Full::new(Bytes::from_static(body.as_bytes())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_bridge_paths() {
        let Route::Bridge(target) = route("/ws/example.com/22") else {
            panic!("expected bridge route");
        };
        assert_eq!(target.host(), "example.com");
        assert_eq!(target.port_raw(), "22");
    }

    #[test]
    fn keeps_unparsed_port_segment() {
        let Route::Bridge(target) = route("/ws/example.com/not-a-port") else {
            panic!("expected bridge route");
        };
        assert!(target.port().is_err());
    }

    #[test]
    fn rejects_malformed_bridge_paths() {
        assert!(matches!(route("/ws"), Route::BadRequest));
        assert!(matches!(route("/ws/"), Route::BadRequest));
        assert!(matches!(route("/ws/example.com"), Route::BadRequest));
        assert!(matches!(route("/ws/example.com/22/extra"), Route::BadRequest));
        assert!(matches!(route("/ws//22"), Route::BadRequest));
    }

    #[test]
    fn unknown_paths_are_not_found() {
        assert!(matches!(route("/"), Route::NotFound));
        assert!(matches!(route("/wss/example.com/22"), Route::NotFound));
        assert!(matches!(route("/api/ws/example.com/22"), Route::NotFound));
    }

    #[test]
    fn extracts_origin_hosts() {
        assert_eq!(origin_host("https://example.com"), Some("example.com"));
        assert_eq!(origin_host("http://example.com:8080"), Some("example.com"));
        assert_eq!(origin_host("example.com"), Some("example.com"));
        assert_eq!(origin_host("http://[::1]:9090"), Some("::1"));
        assert_eq!(origin_host("http://localhost"), Some("localhost"));
        assert_eq!(origin_host(""), None);
    }
}

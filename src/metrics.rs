use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use lazy_static::lazy_static;
use log::{error, info};
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, Encoder, IntCounter,
    IntCounterVec, IntGauge, TextEncoder,
};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::OnceLock;

lazy_static! {
    static ref CONNECTIONS: IntCounter = register_int_counter!(
        "minemock_connections_total",
        "Total number of TCP connections accepted by the mock server."
    )
    .unwrap();
    static ref HANDSHAKE_FAILURES: IntCounterVec = register_int_counter_vec!(
        "minemock_handshake_failures_total",
        "Total number of connections dropped before a valid handshake.",
        &["reason"]
    )
    .unwrap();
    static ref STATUS_REQUESTS: IntCounter = register_int_counter!(
        "minemock_status_requests_total",
        "Total number of status/ping requests served."
    )
    .unwrap();
    static ref LOGIN_ATTEMPTS: IntCounter = register_int_counter!(
        "minemock_login_attempts_total",
        "Total number of login attempts handled."
    )
    .unwrap();
    static ref LOGIN_OUTCOMES: IntCounterVec = register_int_counter_vec!(
        "minemock_login_outcomes_total",
        "Login attempts by outcome.",
        &["outcome"]
    )
    .unwrap();
    static ref BACKEND_FAILURES: IntCounterVec = register_int_counter_vec!(
        "minemock_backend_failures_total",
        "Total number of failed attempts to reach the real server.",
        &["reason"]
    )
    .unwrap();
    static ref ACTIVE_TUNNELS: IntGauge = register_int_gauge!(
        "minemock_active_tunnels",
        "Current number of proxied TCP tunnels."
    )
    .unwrap();
    static ref BYTES_TRANSFERRED: IntCounterVec = register_int_counter_vec!(
        "minemock_bytes_transferred_total",
        "Total number of bytes forwarded through proxied tunnels.",
        &["direction"]
    )
    .unwrap();
    static ref VOICECHAT_DROPS: IntCounterVec = register_int_counter_vec!(
        "minemock_voicechat_drops_total",
        "UDP datagrams dropped by the voice chat relay.",
        &["reason"]
    )
    .unwrap();
    static ref VOICECHAT_SESSIONS: IntGauge = register_int_gauge!(
        "minemock_voicechat_sessions",
        "Current number of live voice chat UDP sessions."
    )
    .unwrap();
    static ref VOICECHAT_AUTHORIZATIONS: IntCounter = register_int_counter!(
        "minemock_voicechat_authorizations_total",
        "Total number of voice chat authorization grants."
    )
    .unwrap();
}

static EXPORTER_STARTED: OnceLock<()> = OnceLock::new();

/// Starts the exporter once per process; later calls are no-ops.
pub fn spawn_metrics_server(addr: SocketAddr) {
    if EXPORTER_STARTED.set(()).is_err() {
        return;
    }

    let builder = match Server::try_bind(&addr) {
        Ok(builder) => builder,
        Err(err) => {
            error!("Cannot bind metrics exporter on {}: {}", addr, err);
            return;
        }
    };

    info!("Metrics exporter serving /metrics on {}", addr);
    tokio::spawn(async move {
        let service = make_service_fn(|_| async {
            Ok::<_, Infallible>(service_fn(|req| async move {
                Ok::<_, Infallible>(respond(&req))
            }))
        });
        if let Err(err) = builder.serve(service).await {
            error!("Metrics exporter exited: {}", err);
        }
    });
}

fn respond(req: &Request<Body>) -> Response<Body> {
    if req.uri().path() == "/healthz" {
        return Response::new(Body::from("ok"));
    }
    if req.uri().path() != "/metrics" {
        return plain(StatusCode::NOT_FOUND, Body::from("no such endpoint"));
    }

    if req.method() == Method::HEAD {
        return plain(StatusCode::OK, Body::empty());
    }
    if req.method() != Method::GET {
        return plain(StatusCode::METHOD_NOT_ALLOWED, Body::empty());
    }
    match render_metrics() {
        Ok(text) => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", TextEncoder::new().format_type())
            .body(Body::from(text))
            .unwrap(),
        Err(err) => {
            error!("Metrics encoding failed: {}", err);
            plain(
                StatusCode::INTERNAL_SERVER_ERROR,
                Body::from("metrics encoding failed"),
            )
        }
    }
}

fn render_metrics() -> prometheus::Result<Vec<u8>> {
    let mut out = Vec::new();
    TextEncoder::new().encode(&prometheus::gather(), &mut out)?;
    Ok(out)
}

fn plain(status: StatusCode, body: Body) -> Response<Body> {
    Response::builder().status(status).body(body).unwrap()
}

pub fn record_connection() {
    CONNECTIONS.inc();
}

pub fn record_handshake_failure(reason: &'static str) {
    HANDSHAKE_FAILURES.with_label_values(&[reason]).inc();
}

pub fn record_status_request() {
    STATUS_REQUESTS.inc();
}

pub fn record_login_attempt() {
    LOGIN_ATTEMPTS.inc();
}

pub fn record_login_outcome(outcome: &'static str) {
    LOGIN_OUTCOMES.with_label_values(&[outcome]).inc();
}

pub fn record_backend_failure(reason: &'static str) {
    BACKEND_FAILURES.with_label_values(&[reason]).inc();
}

pub fn record_tunnel_opened() {
    ACTIVE_TUNNELS.inc();
}

pub fn record_tunnel_closed() {
    ACTIVE_TUNNELS.dec();
}

pub fn record_bytes(direction: &'static str, bytes: usize) {
    if bytes == 0 {
        return;
    }
    BYTES_TRANSFERRED
        .with_label_values(&[direction])
        .inc_by(bytes as u64);
}

pub fn record_voicechat_drop(reason: &'static str) {
    VOICECHAT_DROPS.with_label_values(&[reason]).inc();
}

pub fn record_voicechat_session_opened() {
    VOICECHAT_SESSIONS.inc();
}

pub fn record_voicechat_session_closed() {
    VOICECHAT_SESSIONS.dec();
}

pub fn record_voicechat_authorization() {
    VOICECHAT_AUTHORIZATIONS.inc();
}

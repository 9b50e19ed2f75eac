#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::warn;

use crate::server::state::ServerState;

/// Liveness/readiness probe state plus a view of the relay for `/stats`.
#[derive(Clone)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
	server: ServerState,
}

impl HealthState {
	pub fn new(server: ServerState) -> Self {
		Self {
			ready: Arc::new(AtomicBool::new(false)),
			server,
		}
	}

	/// Flip once the listener is bound and handlers are registered.
	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn mark_not_ready(&self) {
		self.ready.store(false, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}
}

pub fn spawn_health_server(bind: SocketAddr, state: HealthState) {
	tokio::spawn(async move {
		if let Err(err) = run_health_server(bind, state).await {
			warn!(error = %err, "health server stopped");
		}
	});
}

async fn run_health_server(bind: SocketAddr, state: HealthState) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_health(req, state.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "health connection error");
			}
		});
	}
}

async fn handle_health(req: Request<Incoming>, state: HealthState) -> Result<Response<Full<Bytes>>, hyper::Error> {
	if req.method() != Method::GET {
		return Ok(reply(StatusCode::METHOD_NOT_ALLOWED, Bytes::new()));
	}

	let resp = match req.uri().path() {
		"/healthz" => reply(StatusCode::OK, Bytes::from_static(b"ok")),
		"/readyz" if state.is_ready() => reply(StatusCode::OK, Bytes::from_static(b"ready")),
		"/readyz" => reply(StatusCode::SERVICE_UNAVAILABLE, Bytes::from_static(b"not-ready")),
		"/stats" => {
			let body = json!({
				"ready": state.is_ready(),
				"connections": state.server.connections.len().await,
				"online_users": state.server.registry.online_users().await,
				"actions": state.server.handlers.len(),
			});
			let mut resp = reply(StatusCode::OK, Bytes::from(body.to_string()));
			resp.headers_mut()
				.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
			resp
		}
		_ => reply(StatusCode::NOT_FOUND, Bytes::new()),
	};
	Ok(resp)
}

fn reply(status: StatusCode, body: Bytes) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(body));
	*resp.status_mut() = status;
	resp
}

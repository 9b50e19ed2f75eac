#![forbid(unsafe_code)]

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use relay_domain::ConnId;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tracing::{debug, info, warn};

use crate::server::connection::handle_connection;
use crate::server::state::ServerState;

/// Pause after an accept error that is not tied to a single connection
/// (e.g. file descriptor exhaustion).
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Accept loop: one spawned session per connection.
pub struct Listener {
	listener: TcpListener,
	state: ServerState,
	next_conn_id: u64,
	admission: Option<Arc<Semaphore>>,
}

impl Listener {
	/// Bind the listening socket. `max_connections` caps concurrent sessions;
	/// `None` accepts without limit.
	pub async fn bind(addr: SocketAddr, state: ServerState, max_connections: Option<usize>) -> anyhow::Result<Self> {
		let listener = TcpListener::bind(addr)
			.await
			.with_context(|| format!("bind tcp listener on {addr}"))?;
		Ok(Self {
			listener,
			state,
			next_conn_id: 1,
			admission: max_connections.filter(|n| *n > 0).map(|n| Arc::new(Semaphore::new(n))),
		})
	}

	pub fn local_addr(&self) -> io::Result<SocketAddr> {
		self.listener.local_addr()
	}

	/// Accept until `shutdown` flips (or its sender goes away), then ask every
	/// open session to close. Sessions are not awaited.
	pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
		let local = self.local_addr().context("listener local address")?;
		info!(addr = %local, max_connections = ?self.admission.as_ref().map(|s| s.available_permits()), "relay listener accepting");

		while !*shutdown.borrow() {
			let permit = match self.admission.clone() {
				Some(sem) => tokio::select! {
					permit = sem.acquire_owned() => Some(permit.context("admission semaphore closed")?),
					_ = shutdown.changed() => break,
				},
				None => None,
			};

			let accepted = tokio::select! {
				res = self.listener.accept() => res,
				_ = shutdown.changed() => break,
			};

			match accepted {
				Ok((stream, peer)) => self.spawn_session(stream, peer, shutdown.clone(), permit),
				Err(e) if is_connection_error(&e) => {
					metrics::counter!("relay_server_accept_errors_total").increment(1);
					debug!(error = %e, "accept failed for one connection");
				}
				Err(e) if is_listener_gone(&e) => {
					warn!(error = %e, "listening socket unusable; stopping accept loop");
					break;
				}
				Err(e) => {
					metrics::counter!("relay_server_accept_errors_total").increment(1);
					warn!(error = %e, backoff_ms = ACCEPT_ERROR_BACKOFF.as_millis() as u64, "accept failed");
					tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
				}
			}
		}

		let closing = self.state.connections.close_all().await;
		info!(addr = %local, closing, "relay listener stopped");
		Ok(())
	}

	fn spawn_session(
		&mut self,
		stream: TcpStream,
		peer: SocketAddr,
		shutdown: watch::Receiver<bool>,
		permit: Option<OwnedSemaphorePermit>,
	) {
		let conn_id = ConnId(self.next_conn_id);
		self.next_conn_id += 1;
		metrics::counter!("relay_server_connections_total").increment(1);

		if let Err(e) = stream.set_nodelay(true) {
			debug!(%conn_id, error = %e, "failed to set TCP_NODELAY");
		}

		let state = self.state.clone();
		tokio::spawn(async move {
			let _permit = permit;
			info!(%conn_id, %peer, "accepted connection");
			if let Err(e) = handle_connection(conn_id, stream, peer, state, shutdown).await {
				warn!(%conn_id, %peer, error = %format!("{e:#}"), "connection handler exited with error");
			}
		});
	}
}

/// Errors scoped to the connection being accepted; the next accept is fine.
fn is_connection_error(e: &io::Error) -> bool {
	matches!(
		e.kind(),
		io::ErrorKind::ConnectionAborted
			| io::ErrorKind::ConnectionReset
			| io::ErrorKind::ConnectionRefused
			| io::ErrorKind::Interrupted
			| io::ErrorKind::WouldBlock
			| io::ErrorKind::TimedOut
	)
}

/// OS error codes for a closed or invalid listening descriptor (EBADF, ENOTSOCK).
#[cfg(target_os = "linux")]
const LISTENER_GONE_OS_ERRORS: &[i32] = &[9, 88];
#[cfg(all(unix, not(target_os = "linux")))]
const LISTENER_GONE_OS_ERRORS: &[i32] = &[9, 38];
#[cfg(windows)]
const LISTENER_GONE_OS_ERRORS: &[i32] = &[10009, 10038];
#[cfg(not(any(unix, windows)))]
const LISTENER_GONE_OS_ERRORS: &[i32] = &[];

/// Errors meaning the listening socket itself is no longer usable.
fn is_listener_gone(e: &io::Error) -> bool {
	if let Some(code) = e.raw_os_error()
		&& LISTENER_GONE_OS_ERRORS.contains(&code)
	{
		return true;
	}
	matches!(e.kind(), io::ErrorKind::NotConnected | io::ErrorKind::InvalidInput)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn classifies_accept_errors() {
		assert!(is_connection_error(&io::Error::from(io::ErrorKind::ConnectionAborted)));
		assert!(is_connection_error(&io::Error::from(io::ErrorKind::Interrupted)));
		assert!(!is_connection_error(&io::Error::from(io::ErrorKind::OutOfMemory)));

		assert!(is_listener_gone(&io::Error::from(io::ErrorKind::InvalidInput)));
		assert!(!is_listener_gone(&io::Error::from(io::ErrorKind::ConnectionReset)));
	}

	#[test]
	fn closed_listening_descriptor_stops_the_loop() {
		for code in LISTENER_GONE_OS_ERRORS {
			let e = io::Error::from_raw_os_error(*code);
			assert!(is_listener_gone(&e), "{e}");
			assert!(!is_connection_error(&e), "{e}");
		}
	}

	#[cfg(target_os = "linux")]
	#[test]
	fn ebadf_is_recognised_on_linux() {
		assert!(is_listener_gone(&io::Error::from_raw_os_error(9)));
		assert!(!is_listener_gone(&io::Error::from_raw_os_error(24)), "EMFILE backs off instead");
	}
}

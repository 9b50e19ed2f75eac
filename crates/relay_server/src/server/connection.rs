#![forbid(unsafe_code)]

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use bytes::Bytes;
use relay_domain::ConnId;
use relay_protocol::{DEFAULT_MAX_FRAME_SIZE, FrameDecoder, FramingError, Request, Response, encode_frame};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Notify, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::server::dispatch::HandlerContext;
use crate::server::state::ServerState;

/// Minimum spare capacity reserved in the read buffer before each socket read.
const READ_CHUNK: usize = 8 * 1024;

/// How long a closing session waits for its writer to flush queued frames.
/// A peer that stopped reading would otherwise pin the writer forever.
const WRITER_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Per-connection server settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	/// Largest accepted request payload and largest written response payload.
	pub max_frame_bytes: usize,

	/// Bound of the outbound queue feeding the connection's writer task.
	pub outbound_queue_capacity: usize,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			outbound_queue_capacity: 1024,
		}
	}
}

/// Lifecycle of one accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
	Connecting,
	Open,
	Closing,
	Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EnqueueError {
	#[error("outbound queue is full")]
	Full,
	#[error("connection is closed")]
	Closed,
}

/// Shareable reference to a live session.
///
/// The socket stays owned by the session (read half) and its writer task
/// (write half); everything else talks to the connection through the bounded
/// outbound queue, so bytes hit the wire in enqueue order.
#[derive(Clone)]
pub struct ConnectionHandle {
	conn_id: ConnId,
	peer: SocketAddr,
	outbound: mpsc::Sender<Bytes>,
	close: Arc<Notify>,
}

impl ConnectionHandle {
	pub fn new(conn_id: ConnId, peer: SocketAddr, outbound: mpsc::Sender<Bytes>, close: Arc<Notify>) -> Self {
		Self {
			conn_id,
			peer,
			outbound,
			close,
		}
	}

	pub fn conn_id(&self) -> ConnId {
		self.conn_id
	}

	pub fn peer(&self) -> SocketAddr {
		self.peer
	}

	/// Queue a frame without waiting; used for third-party deliveries.
	pub fn try_enqueue(&self, frame: Bytes) -> Result<(), EnqueueError> {
		self.outbound.try_send(frame).map_err(|e| match e {
			TrySendError::Full(_) => EnqueueError::Full,
			TrySendError::Closed(_) => EnqueueError::Closed,
		})
	}

	/// Queue a frame, waiting for room; used for the session's own replies.
	pub async fn enqueue(&self, frame: Bytes) -> Result<(), EnqueueError> {
		self.outbound.send(frame).await.map_err(|_| EnqueueError::Closed)
	}

	/// Ask the owning session to close. Idempotent.
	pub fn close(&self) {
		self.close.notify_one();
	}

	pub fn is_closed(&self) -> bool {
		self.outbound.is_closed()
	}
}

impl PartialEq for ConnectionHandle {
	fn eq(&self, other: &Self) -> bool {
		self.conn_id == other.conn_id
	}
}

impl Eq for ConnectionHandle {}

impl fmt::Debug for ConnectionHandle {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ConnectionHandle")
			.field("conn_id", &self.conn_id)
			.field("peer", &self.peer)
			.field("closed", &self.is_closed())
			.finish()
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
	PeerClosed,
	Requested,
	Shutdown,
	WriterGone,
}

impl CloseReason {
	fn as_str(self) -> &'static str {
		match self {
			CloseReason::PeerClosed => "peer closed",
			CloseReason::Requested => "close requested",
			CloseReason::Shutdown => "server shutdown",
			CloseReason::WriterGone => "writer stopped",
		}
	}
}

struct Lifecycle {
	conn_id: ConnId,
	state: SessionState,
}

impl Lifecycle {
	fn new(conn_id: ConnId) -> Self {
		Self {
			conn_id,
			state: SessionState::Connecting,
		}
	}

	fn advance(&mut self, next: SessionState) {
		debug!(conn_id = %self.conn_id, from = ?self.state, to = ?next, "session state");
		self.state = next;
	}
}

/// Run one accepted connection until it closes.
///
/// Requests are handled strictly one at a time: request N's reply is queued
/// before request N+1 is decoded. On exit every registry entry owned by this
/// connection is released and queued frames are flushed before the socket is
/// shut down.
pub async fn handle_connection(
	conn_id: ConnId,
	stream: TcpStream,
	peer: SocketAddr,
	state: ServerState,
	mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("relay_server_active_connections").decrement(1.0);
		}
	}

	metrics::gauge!("relay_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let mut lifecycle = Lifecycle::new(conn_id);
	let settings = state.settings.clone();

	let (mut read_half, write_half) = stream.into_split();
	let (outbound_tx, outbound_rx) = mpsc::channel::<Bytes>(settings.outbound_queue_capacity.max(1));
	let close = Arc::new(Notify::new());
	let (stop_tx, stop_rx) = oneshot::channel::<()>();

	let handle = ConnectionHandle::new(conn_id, peer, outbound_tx, Arc::clone(&close));
	let mut writer_task = tokio::spawn(write_loop(conn_id, write_half, outbound_rx, stop_rx, Arc::clone(&close)));

	state.connections.insert(handle.clone()).await;
	lifecycle.advance(SessionState::Open);

	let ctx = HandlerContext::new(handle, state.registry.clone(), state.router.clone());
	let mut decoder = FrameDecoder::new(settings.max_frame_bytes);

	let outcome = read_loop(&ctx, &state, &mut read_half, &mut decoder, &close, &mut shutdown).await;
	lifecycle.advance(SessionState::Closing);

	let released = state.registry.remove_by_handle(conn_id).await;
	state.connections.remove(conn_id).await;
	drop(ctx);

	let _ = stop_tx.send(());
	match tokio::time::timeout(WRITER_FLUSH_TIMEOUT, &mut writer_task).await {
		Ok(Ok(Ok(()))) => {}
		Ok(Ok(Err(e))) => debug!(%conn_id, error = %e, "writer finished with error"),
		Ok(Err(e)) => warn!(%conn_id, error = %e, "writer task failed"),
		Err(_) => {
			writer_task.abort();
			warn!(%conn_id, timeout_ms = WRITER_FLUSH_TIMEOUT.as_millis() as u64, "writer flush timed out; dropping queued frames");
		}
	}
	drop(read_half);
	lifecycle.advance(SessionState::Closed);

	match outcome {
		Ok(reason) => {
			info!(
				%conn_id,
				%peer,
				reason = reason.as_str(),
				released = ?released,
				unread_bytes = decoder.buffered_len(),
				"connection closed"
			);
			Ok(())
		}
		Err(e) => {
			info!(%conn_id, %peer, released = ?released, "connection closed after error");
			Err(e)
		}
	}
}

async fn read_loop(
	ctx: &HandlerContext,
	state: &ServerState,
	read_half: &mut OwnedReadHalf,
	decoder: &mut FrameDecoder,
	close: &Notify,
	shutdown: &mut watch::Receiver<bool>,
) -> anyhow::Result<CloseReason> {
	if *shutdown.borrow() {
		return Ok(CloseReason::Shutdown);
	}

	loop {
		loop {
			let request = match decoder.next_frame::<Request>() {
				Ok(Some(request)) => request,
				Ok(None) => break,
				Err(e) => {
					metrics::counter!("relay_server_decode_errors_total").increment(1);
					notify_malformed(ctx, &e, decoder.max_frame_size());
					return Err(anyhow!(e).context("failed to decode request frame"));
				}
			};
			metrics::counter!("relay_server_frames_in_total").increment(1);

			let response = state.handlers.dispatch(request, ctx).await;
			let frame = encode_reply(ctx.conn().conn_id(), response, decoder.max_frame_size())?;
			// The peer may have stopped reading; a full queue must not hide close or shutdown.
			tokio::select! {
				res = ctx.conn().enqueue(frame) => if res.is_err() {
					return Ok(CloseReason::WriterGone);
				},
				_ = close.notified() => return Ok(CloseReason::Requested),
				_ = shutdown.changed() => return Ok(CloseReason::Shutdown),
			}
		}

		decoder.buffer_mut().reserve(READ_CHUNK);
		tokio::select! {
			res = read_half.read_buf(decoder.buffer_mut()) => match res {
				Ok(0) => return Ok(CloseReason::PeerClosed),
				Ok(n) => metrics::counter!("relay_server_bytes_in_total").increment(n as u64),
				Err(e) => return Err(anyhow!(e).context("socket read failed")),
			},
			_ = close.notified() => return Ok(CloseReason::Requested),
			_ = shutdown.changed() => return Ok(CloseReason::Shutdown),
		}
	}
}

/// Encode a reply, replacing it with an error reply when it is over the limit.
fn encode_reply(conn_id: ConnId, response: Response, max_frame_size: usize) -> anyhow::Result<Bytes> {
	match encode_frame(&response, max_frame_size) {
		Ok(frame) => Ok(Bytes::from(frame)),
		Err(FramingError::FrameTooLarge { len, max }) => {
			warn!(%conn_id, action = %response.action, len, max, "reply exceeds frame limit; sending error instead");
			let fallback = Response::error(response.action, "response exceeds maximum frame size");
			let frame = encode_frame(&fallback, max_frame_size).context("encode fallback reply")?;
			Ok(Bytes::from(frame))
		}
		Err(e) => Err(anyhow!(e).context("encode reply")),
	}
}

/// Best-effort notice to the peer before a fatal framing error closes it.
fn notify_malformed(ctx: &HandlerContext, err: &FramingError, max_frame_size: usize) {
	let notice = Response::error("error", format!("malformed frame: {err}"));
	if let Ok(frame) = encode_frame(&notice, max_frame_size) {
		let _ = ctx.conn().try_enqueue(Bytes::from(frame));
	}
}

async fn write_loop(
	conn_id: ConnId,
	mut writer: OwnedWriteHalf,
	mut outbound: mpsc::Receiver<Bytes>,
	mut stop: oneshot::Receiver<()>,
	close: Arc<Notify>,
) -> anyhow::Result<()> {
	let result = async {
		loop {
			tokio::select! {
				biased;
				frame = outbound.recv() => match frame {
					Some(frame) => write_frame(&mut writer, &frame).await?,
					None => break,
				},
				_ = &mut stop => {
					outbound.close();
					while let Ok(frame) = outbound.try_recv() {
						write_frame(&mut writer, &frame).await?;
					}
					break;
				}
			}
		}
		writer.shutdown().await.context("socket shutdown")?;
		Ok::<(), anyhow::Error>(())
	}
	.await;

	if let Err(e) = &result {
		debug!(%conn_id, error = %e, "writer stopping; closing session");
		close.notify_one();
	}
	result
}

async fn write_frame(writer: &mut OwnedWriteHalf, frame: &[u8]) -> anyhow::Result<()> {
	writer.write_all(frame).await.context("socket write")?;
	metrics::counter!("relay_server_frames_out_total").increment(1);
	metrics::counter!("relay_server_bytes_out_total").increment(frame.len() as u64);
	Ok(())
}

/// Handle backed by a bare channel, for exercising registry and router code
/// without sockets.
#[cfg(test)]
pub(crate) fn detached_handle(conn_id: u64, capacity: usize) -> (ConnectionHandle, mpsc::Receiver<Bytes>) {
	let (tx, rx) = mpsc::channel(capacity);
	let peer = SocketAddr::from(([127, 0, 0, 1], 0));
	(ConnectionHandle::new(ConnId(conn_id), peer, tx, Arc::new(Notify::new())), rx)
}

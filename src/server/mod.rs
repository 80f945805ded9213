//! TCP connection server.
//!
//! One accept loop, one named handler thread per connection. Each
//! connection is strictly serial: read one frame, dispatch it, write one
//! frame. There is no pipelining and no request id — clients wanting
//! parallelism open more connections.
//!
//! A connection starts unauthenticated. When `auth_required` is set, the
//! first served request must be CONNECT with valid credentials; failed
//! credentials get an ERROR frame and the connection closes. Framing
//! violations (bad magic, bad version, oversized payload) close the
//! connection without a reply, as does a socket timeout (30 s of
//! inactivity) or an internal invariant failure — other connections are
//! unaffected.

mod dispatch;

use std::io;
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::SOCKET_TIMEOUT_SECS;
use crate::protocol::{self, ProtocolError, RequestType};
use crate::store::Store;

use dispatch::{Outcome, dispatch};

/// Errors that stop the server as a whole (not a single connection).
#[derive(Debug, Error)]
pub enum ServerError {
    /// Binding or accepting failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// The connection server. Owns an `Arc<Store>` shared with every
/// handler thread.
pub struct Server {
    store: Arc<Store>,
}

impl Server {
    /// Wraps a store for serving.
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Binds the configured address and serves until the process exits.
    pub fn run(&self) -> Result<(), ServerError> {
        let addr = format!(
            "{}:{}",
            self.store.config().listen_host,
            self.store.config().listen_port
        );
        let listener = TcpListener::bind(&addr)?;
        info!(addr = %addr, "listening");
        self.serve(listener)
    }

    /// Serves connections from an already-bound listener (lets tests use
    /// an ephemeral port).
    pub fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let conn_counter = AtomicU64::new(0);
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let store = Arc::clone(&self.store);
                    let conn_id = conn_counter.fetch_add(1, Ordering::Relaxed);
                    let spawned = std::thread::Builder::new()
                        .name(format!("nexadb-conn-{conn_id}"))
                        .spawn(move || handle_connection(store, stream, conn_id));
                    if let Err(e) = spawned {
                        error!(error = %e, "failed to spawn connection handler");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                }
            }
        }
        Ok(())
    }
}

fn handle_connection(store: Arc<Store>, mut stream: TcpStream, conn_id: u64) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".into());
    debug!(conn_id, peer = %peer, "connection opened");

    let timeout = Some(Duration::from_secs(SOCKET_TIMEOUT_SECS));
    if stream.set_read_timeout(timeout).is_err() || stream.set_write_timeout(timeout).is_err() {
        warn!(conn_id, "failed to set socket timeouts");
        return;
    }

    // Auth state lives on the connection and never resets.
    let mut authenticated = !store.config().auth_required;

    loop {
        let frame = match protocol::read_frame(&mut stream) {
            Ok(frame) => frame,
            Err(ProtocolError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                debug!(conn_id, "peer closed connection");
                return;
            }
            Err(e) => {
                // Framing violations and timeouts close without a reply.
                debug!(conn_id, error = %e, "connection closed on framing error");
                return;
            }
        };

        let request = match RequestType::try_from(frame.frame_type) {
            Ok(request) => request,
            Err(byte) => {
                debug!(conn_id, frame_type = byte, "unknown request type");
                let _ = dispatch::write_error(
                    &mut stream,
                    crate::protocol::ErrorCode::BadRequest,
                    &format!("unknown request type 0x{byte:02X}"),
                );
                continue;
            }
        };

        match dispatch(&store, request, &frame.payload, &mut authenticated) {
            Outcome::Respond(response_type, payload) => {
                if let Err(e) = protocol::write_frame(&mut stream, response_type as u8, &payload) {
                    debug!(conn_id, error = %e, "write failed; closing");
                    return;
                }
            }
            Outcome::RespondAndClose(response_type, payload) => {
                let _ = protocol::write_frame(&mut stream, response_type as u8, &payload);
                debug!(conn_id, "connection closed by dispatcher");
                return;
            }
            Outcome::Close => {
                debug!(conn_id, "connection aborted");
                return;
            }
        }
    }
}

//! Per-connection task.
//!
//! Reads the socket into a `FrameAssembler`, hands complete frames to the
//! negotiator and dispatcher one at a time, and writes each response before
//! the next frame is looked at.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tracing::Instrument;

use crate::dispatch::pages;
use crate::net::ConnectionPermit;
use crate::observability::metrics::record_response;
use crate::protocol::{FrameAssembler, Negotiation, ProtocolError, ResponseEncoder, Teardown};
use crate::server::Shared;
use crate::session::ConnectionContext;

const READ_CHUNK: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

enum Event {
    Read(io::Result<usize>),
    Idle,
    Stop,
}

pub(crate) async fn handle_connection(
    shared: Arc<Shared>,
    mut stream: TcpStream,
    peer: SocketAddr,
    _permit: ConnectionPermit,
    mut stop: broadcast::Receiver<()>,
) {
    let mut ctx = ConnectionContext::new(peer);
    let _guard = shared.tracker.track(ctx.id);
    let mut assembler = FrameAssembler::new(Arc::clone(&shared.boundary), shared.config.framing.max_frame_bytes);
    let idle = Duration::from_millis(shared.config.framing.idle_dispatch_ms);
    let mut chunk = vec![0u8; READ_CHUNK];

    tracing::debug!(connection_id = %ctx.id, peer = %peer, "Connection opened");

    'conn: loop {
        while let Some(frame) = assembler.next_frame() {
            if process_frame(&shared, &mut ctx, &mut stream, frame).await == Flow::Close {
                break 'conn;
            }
        }

        // The idle timer only runs while something is buffered.
        let event = if assembler.is_empty() {
            tokio::select! {
                _ = stop.recv() => Event::Stop,
                read = stream.read(&mut chunk) => Event::Read(read),
            }
        } else {
            tokio::select! {
                _ = stop.recv() => Event::Stop,
                read = tokio::time::timeout(idle, stream.read(&mut chunk)) => {
                    read.map_or(Event::Idle, Event::Read)
                }
            }
        };

        match event {
            Event::Stop => {
                tracing::debug!(connection_id = %ctx.id, "Closing for shutdown");
                break;
            }
            Event::Idle => {
                tracing::trace!(connection_id = %ctx.id, buffered = assembler.buffered(), "Idle timer fired");
                if let Some(frame) = assembler.flush_idle() {
                    if process_frame(&shared, &mut ctx, &mut stream, frame).await == Flow::Close {
                        break;
                    }
                }
            }
            Event::Read(Ok(0)) => {
                tracing::debug!(connection_id = %ctx.id, "Connection closed by peer");
                break;
            }
            Event::Read(Ok(n)) => {
                if let Err(e) = assembler.extend(&chunk[..n]) {
                    tracing::warn!(connection_id = %ctx.id, error = %e, "Dropping connection");
                    break;
                }
            }
            Event::Read(Err(e)) => {
                tracing::debug!(connection_id = %ctx.id, error = %e, "Read failed");
                break;
            }
        }
    }

    assembler.clear();
    ctx.reset_security();
    shared.registry.unbind_connection(ctx.id);
    tracing::debug!(connection_id = %ctx.id, ssid = ?ctx.ssid, "Connection finished");
}

async fn process_frame(shared: &Shared, ctx: &mut ConnectionContext, stream: &mut TcpStream, frame: Bytes) -> Flow {
    let span = tracing::info_span!(
        "frame",
        connection_id = %ctx.id,
        request_id = tracing::field::Empty
    );
    respond(shared, ctx, stream, frame).instrument(span).await
}

async fn respond(shared: &Shared, ctx: &mut ConnectionContext, stream: &mut TcpStream, frame: Bytes) -> Flow {
    let started = Instant::now();

    let response = match shared.negotiator.negotiate(ctx, &shared.registry, &frame) {
        Ok(Negotiation::Dispatch(request)) => {
            tracing::Span::current().record("request_id", tracing::field::display(request.request_id));
            let dispatched = shared.dispatch(request, ctx.id).await;
            if dispatched.close {
                ctx.close_after_response = true;
            }
            dispatched.response
        }
        Ok(Negotiation::Relogin) => pages::relogin(),
        Ok(Negotiation::BadRequest) => {
            ctx.close_after_response = true;
            shared.dispatcher.error_page("the request carried no url")
        }
        Err(ProtocolError::EmptyFrame) => {
            tracing::debug!(connection_id = %ctx.id, "Empty frame, closing");
            return Flow::Close;
        }
        Err(e) => {
            tracing::warn!(connection_id = %ctx.id, ssid = ?ctx.ssid, error = %e, "Could not decode frame");
            shared.dispatcher.error_page(&e.to_string())
        }
    };

    let status = response.status_code();
    let encoded = match ResponseEncoder::encode(ctx, response) {
        Ok(encoded) => encoded,
        Err(e) => {
            tracing::warn!(connection_id = %ctx.id, error = %e, "Could not encode response");
            return Flow::Close;
        }
    };

    if let Err(e) = stream.write_all(&encoded.bytes).await {
        tracing::debug!(connection_id = %ctx.id, error = %e, "Write failed");
        return Flow::Close;
    }
    record_response(status, started);
    tracing::debug!(
        connection_id = %ctx.id,
        status = ?status,
        bytes = encoded.bytes.len(),
        teardown = ?encoded.teardown,
        "Response sent"
    );

    match encoded.teardown {
        Teardown::KeepOpen => Flow::Continue,
        Teardown::Graceful => {
            if let Err(e) = stream.shutdown().await {
                tracing::debug!(connection_id = %ctx.id, error = %e, "Shutdown failed");
            }
            Flow::Close
        }
        Teardown::Abort => {
            abort(stream);
            Flow::Close
        }
    }
}

/// Reset instead of the usual FIN once the stream is dropped.
#[allow(deprecated)]
fn abort(stream: &TcpStream) {
    if let Err(e) = stream.set_linger(Some(Duration::ZERO)) {
        tracing::debug!(error = %e, "Could not set linger");
    }
}

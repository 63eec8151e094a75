//! Per-connection loops.
//!
//! Each connection gets a read loop on its own thread (frames are
//! processed strictly in order, under the session's ambient binding) and
//! a writer thread draining the outbound frame channel. Computation
//! workers and the frame handler both write through that channel, so a
//! closed peer degrades to silent drops rather than blocking anyone.

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::sync::Arc;

use crossbeam::channel::{Receiver, unbounded};

use crate::reactive::{SessionId, session};
use crate::server::mux::{ConnectionCtx, Mux};
use crate::server::proto::{ClientFrame, ServerFrame, decode_frame_with_limits, encode_frame};
use crate::server::run::ServerShared;

pub(crate) fn handle_connection(stream: TcpStream, shared: Arc<ServerShared>) {
    let peer = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    let write_half = match stream.try_clone() {
        Ok(half) => half,
        Err(err) => {
            tracing::error!(%peer, error = %err, "failed to clone stream");
            return;
        }
    };

    let session = SessionId::new();
    tracing::debug!(%peer, %session, "connection open");

    let (out_tx, out_rx) = unbounded::<ServerFrame>();
    let writer = std::thread::spawn(move || write_loop(write_half, out_rx));

    // Session-scoped stores created inside the factory bind to this
    // connection's session.
    let actions = session::with(session, || (shared.factory)());
    let ctx = ConnectionCtx {
        session,
        actions,
        outbound: out_tx,
    };

    let reader = BufReader::new(stream);
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break, // client disconnected
        };
        if line.trim().is_empty() {
            continue;
        }

        let frame = match decode_frame_with_limits(&line, &shared.limits) {
            Ok(frame) => frame,
            Err(err) => {
                let _ = ctx.outbound.send(ServerFrame::protocol_error(err.to_string()));
                continue;
            }
        };

        session::with(session, || dispatch(&ctx, &shared.mux, frame));
    }

    // Cancel subscriptions before releasing session state.
    shared.mux.close_session(session);
    session::end(session);
    drop(ctx);
    let _ = writer.join();
    tracing::debug!(%peer, %session, "connection closed");
}

fn dispatch(ctx: &ConnectionCtx, mux: &Mux, frame: ClientFrame) {
    match frame {
        ClientFrame::Subscribe {
            name,
            sub_id,
            params,
        } => mux.subscribe(ctx, name, sub_id, params),
        ClientFrame::Unsubscribe {
            name,
            sub_id,
            params,
        } => mux.unsubscribe(ctx, name, sub_id, params),
        ClientFrame::Mutation {
            name,
            request_id,
            params,
        } => mux.mutate(ctx, name, request_id, params),
    }
}

fn write_loop(mut stream: TcpStream, rx: Receiver<ServerFrame>) {
    for frame in rx {
        let bytes = match encode_frame(&frame) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::error!(error = %err, "frame encode failed");
                continue;
            }
        };
        if stream.write_all(&bytes).is_err() || stream.flush().is_err() {
            // Peer is gone; dropping the receiver turns every further
            // send into a silent drop.
            break;
        }
    }
}

//! Per-connection lifecycle: activate, read-dispatch loop, deactivate.
//!
//! Shared by the listener and the initiator. The read loop is the only
//! place that decodes from a connection, so dispatches for one connection
//! never overlap.

use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::codec::FramedRead;

use natter_core::EnvelopeCodec;

use super::Context;
use crate::dispatch::{self, guarded};

/// What to do with an envelope whose code has no handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnknownCodePolicy {
    /// Treat it as a protocol violation and end the connection.
    Terminate,
    /// Log it and keep reading.
    Skip,
}

/// Notify every registered handler that `ctx` is live.
pub async fn activate(ctx: &Context) {
    for handler in ctx.registry().handlers() {
        guarded("on_active", ctx, handler.on_active(ctx)).await;
    }
}

/// Notify every registered handler that `ctx` is gone. A panicking
/// handler does not keep later handlers from being notified.
pub async fn deactivate(ctx: &Context) {
    for handler in ctx.registry().handlers() {
        guarded("on_close", ctx, handler.on_close(ctx)).await;
    }
}

/// Decode and dispatch envelopes until the peer goes away, a decode fails,
/// or the context is closed.
pub async fn read_loop<R>(
    ctx: &Context,
    mut reader: FramedRead<R, EnvelopeCodec>,
    policy: UnknownCodePolicy,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let next = tokio::select! {
            _ = ctx.closed() => break,
            next = reader.next() => next,
        };

        let env = match next {
            Some(Ok(env)) => env,
            Some(Err(e)) => {
                tracing::warn!(remote = ctx.remote_addr(), error = %e, "read failed");
                break;
            }
            None => {
                tracing::debug!(remote = ctx.remote_addr(), "peer closed the connection");
                break;
            }
        };

        if let Err(e) = ctx.registry().run_before(ctx, &env) {
            dispatch::report(ctx, &e);
            continue;
        }

        let Some(handler) = ctx.registry().handler(env.code) else {
            match policy {
                UnknownCodePolicy::Terminate => {
                    tracing::warn!(
                        remote = ctx.remote_addr(),
                        code = env.code,
                        "no handler for message code, closing"
                    );
                    break;
                }
                UnknownCodePolicy::Skip => {
                    tracing::debug!(
                        remote = ctx.remote_addr(),
                        code = env.code,
                        "no handler for message code, skipping"
                    );
                    continue;
                }
            }
        };

        if let Err(e) = dispatch::dispatch(handler.as_ref(), ctx, &env).await {
            dispatch::report(ctx, &e);
        }

        if ctx.is_closed() {
            break;
        }
    }
}

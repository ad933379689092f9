//! Fault-isolated dispatch — routes an envelope to its handler and turns
//! both returned errors and panics into a [`DispatchError`].

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Once;

use futures::FutureExt;
use natter_core::{Envelope, MessageCode};

use crate::service::Handler;
use crate::session::Context;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("handler for code {code} failed: {reason}")]
    HandlerFailed { code: MessageCode, reason: String },

    #[error("handler for code {code} panicked: {message}")]
    HandlerPanicked {
        code: MessageCode,
        message: String,
        backtrace: String,
    },

    #[error("interceptor {name} rejected envelope: {reason}")]
    InterceptorRejected { name: String, reason: String },

    #[error("interceptor {name} panicked: {message}")]
    InterceptorPanicked { name: String, message: String },
}

thread_local! {
    /// Set while a handler future is being polled.
    static ARMED: Cell<bool> = const { Cell::new(false) };
    /// Backtrace recorded by the panic hook for the armed poll.
    static PANIC_TRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Chain a panic hook that records where an armed handler panicked. The
/// unwind has already left that frame by the time `catch_unwind` returns.
fn install_panic_hook() {
    static HOOK: Once = Once::new();
    HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if ARMED.with(Cell::get) {
                let trace = Backtrace::force_capture().to_string();
                PANIC_TRACE.with(|slot| *slot.borrow_mut() = Some(trace));
            }
            previous(info);
        }));
    });
}

/// Invoke `handler.on_message`, catching any panic it raises.
pub async fn dispatch(
    handler: &dyn Handler,
    ctx: &Context,
    env: &Envelope,
) -> Result<(), DispatchError> {
    install_panic_hook();
    let mut fut = std::pin::pin!(handler.on_message(ctx, env));
    let armed = futures::future::poll_fn(|cx| {
        ARMED.with(|a| a.set(true));
        let poll = fut.as_mut().poll(cx);
        ARMED.with(|a| a.set(false));
        poll
    });

    match AssertUnwindSafe(armed).catch_unwind().await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(DispatchError::HandlerFailed {
            code: env.code,
            reason: format!("{e:#}"),
        }),
        Err(payload) => {
            ARMED.with(|a| a.set(false));
            let backtrace = PANIC_TRACE
                .with(|slot| slot.borrow_mut().take())
                .unwrap_or_else(|| "backtrace unavailable".to_string());
            Err(DispatchError::HandlerPanicked {
                code: env.code,
                message: panic_message(payload.as_ref()),
                backtrace,
            })
        }
    }
}

/// Run a lifecycle hook, logging instead of unwinding if it panics.
pub async fn guarded<F>(hook: &'static str, ctx: &Context, fut: F)
where
    F: Future<Output = ()>,
{
    if let Err(payload) = AssertUnwindSafe(fut).catch_unwind().await {
        tracing::error!(
            hook,
            remote = ctx.remote_addr(),
            panic = %panic_message(payload.as_ref()),
            "lifecycle hook panicked"
        );
    }
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Log a dispatch failure with the connection it happened on.
pub fn report(ctx: &Context, err: &DispatchError) {
    match err {
        DispatchError::HandlerPanicked {
            code,
            message,
            backtrace,
        } => tracing::error!(
            remote = ctx.remote_addr(),
            code,
            panic = %message,
            backtrace = %backtrace,
            "handler panicked"
        ),
        DispatchError::HandlerFailed { code, reason } => {
            tracing::warn!(remote = ctx.remote_addr(), code, error = %reason, "handler failed")
        }
        DispatchError::InterceptorRejected { name, reason } => {
            tracing::debug!(remote = ctx.remote_addr(), name = %name, reason = %reason, "envelope rejected")
        }
        DispatchError::InterceptorPanicked { name, message } => tracing::error!(
            remote = ctx.remote_addr(),
            name = %name,
            panic = %message,
            "interceptor before-hook panicked"
        ),
    }
}

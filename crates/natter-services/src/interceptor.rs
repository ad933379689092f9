//! Interceptor chain — hooks that see every envelope on every connection.
//!
//! Before-hooks run in registration order on each inbound envelope before
//! routing. The first hook that rejects or panics stops the pass and the
//! envelope is dropped. After-hooks run on each outbound envelope once the
//! write has been decided; faults there are logged and the write proceeds.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use natter_core::Envelope;

use crate::dispatch::{panic_message, DispatchError};
use crate::session::Context;

/// Cross-cutting hook pair invoked independently of the message code.
pub trait Interceptor: Send + Sync {
    fn name(&self) -> &str;

    /// Inspect an inbound envelope. `Err` drops it.
    fn on_read(&self, _ctx: &Context, _env: &Envelope) -> anyhow::Result<()> {
        Ok(())
    }

    /// Observe an outbound envelope.
    fn on_write(&self, _ctx: &Context, _env: &Envelope) {}
}

/// Run every before-hook in order. Stops at the first rejection or fault.
pub fn run_before(
    chain: &[Arc<dyn Interceptor>],
    ctx: &Context,
    env: &Envelope,
) -> Result<(), DispatchError> {
    for interceptor in chain {
        match catch_unwind(AssertUnwindSafe(|| interceptor.on_read(ctx, env))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(DispatchError::InterceptorRejected {
                    name: interceptor.name().to_string(),
                    reason: format!("{e:#}"),
                })
            }
            Err(payload) => {
                return Err(DispatchError::InterceptorPanicked {
                    name: interceptor.name().to_string(),
                    message: panic_message(payload.as_ref()),
                })
            }
        }
    }
    Ok(())
}

/// Run every after-hook in order. A fault ends the pass for this envelope
/// only and is logged.
pub fn run_after(chain: &[Arc<dyn Interceptor>], ctx: &Context, env: &Envelope) {
    for interceptor in chain {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| interceptor.on_write(ctx, env))) {
            tracing::error!(
                name = interceptor.name(),
                remote = ctx.remote_addr(),
                code = env.code,
                panic = %panic_message(payload.as_ref()),
                "interceptor after-hook panicked"
            );
            return;
        }
    }
}

// ── Count interceptor ─────────────────────────────────────────────────────────

/// Counts envelopes read and written across all connections.
#[derive(Debug, Default)]
pub struct CountInterceptor {
    received: AtomicU64,
    sent: AtomicU64,
}

impl CountInterceptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

impl Interceptor for CountInterceptor {
    fn name(&self) -> &str {
        "count"
    }

    fn on_read(&self, ctx: &Context, env: &Envelope) -> anyhow::Result<()> {
        let total = self.received.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(remote = ctx.remote_addr(), code = env.code, total, "envelope received");
        Ok(())
    }

    fn on_write(&self, ctx: &Context, env: &Envelope) {
        let total = self.sent.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(remote = ctx.remote_addr(), code = env.code, total, "envelope sent");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::test_context;
    use natter_core::MessageType;
    use std::sync::Mutex;

    struct Recording {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        reject: bool,
        panic: bool,
    }

    impl Interceptor for Recording {
        fn name(&self) -> &str {
            self.name
        }

        fn on_read(&self, _ctx: &Context, _env: &Envelope) -> anyhow::Result<()> {
            self.log.lock().unwrap().push(self.name);
            if self.panic {
                panic!("{} exploded", self.name);
            }
            if self.reject {
                anyhow::bail!("{} says no", self.name);
            }
            Ok(())
        }

        fn on_write(&self, _ctx: &Context, _env: &Envelope) {
            self.log.lock().unwrap().push(self.name);
            if self.panic {
                panic!("{} exploded", self.name);
            }
        }
    }

    type Log = Arc<Mutex<Vec<&'static str>>>;

    fn chain(hooks: &[(&'static str, bool, bool)]) -> (Vec<Arc<dyn Interceptor>>, Log) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = hooks
            .iter()
            .map(|&(name, reject, panic)| {
                Arc::new(Recording { name, log: log.clone(), reject, panic }) as Arc<dyn Interceptor>
            })
            .collect();
        (chain, log)
    }

    #[tokio::test]
    async fn before_hooks_run_in_order() {
        let (ctx, _peer) = test_context();
        let (chain, log) = chain(&[("a", false, false), ("b", false, false)]);
        run_before(&chain, &ctx, &Envelope::empty(MessageType::Ping)).unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn rejection_stops_the_pass() {
        let (ctx, _peer) = test_context();
        let (chain, log) = chain(&[("a", true, false), ("b", false, false)]);
        let err = run_before(&chain, &ctx, &Envelope::empty(MessageType::Ping)).unwrap_err();
        assert!(matches!(err, DispatchError::InterceptorRejected { ref name, .. } if name == "a"));
        assert_eq!(*log.lock().unwrap(), vec!["a"]);
    }

    #[tokio::test]
    async fn panic_is_contained_and_only_aborts_current_message() {
        let (ctx, _peer) = test_context();
        let (chain, log) = chain(&[("a", false, true), ("b", false, false)]);
        let env = Envelope::empty(MessageType::Ping);

        let err = run_before(&chain, &ctx, &env).unwrap_err();
        assert!(matches!(err, DispatchError::InterceptorPanicked { ref message, .. } if message == "a exploded"));

        run_after(&chain, &ctx, &env);
        assert_eq!(*log.lock().unwrap(), vec!["a", "a"]);
    }

    #[tokio::test]
    async fn count_interceptor_counts_both_directions() {
        let (ctx, _peer) = test_context();
        let counter = CountInterceptor::new();
        let env = Envelope::display("x");
        counter.on_read(&ctx, &env).unwrap();
        counter.on_read(&ctx, &env).unwrap();
        counter.on_write(&ctx, &env);
        assert_eq!(counter.received(), 2);
        assert_eq!(counter.sent(), 1);
    }
}

//! Liveness monitor — periodic ping, pong tracking, dead-peer eviction.
//!
//! [`PongHandler`] lives on the side that probes (the server). One ticker
//! task per registration walks every tracked connection: peers that have
//! not answered within `max_no_reply` are closed, the rest get a ping.
//! [`PingHandler`] lives on the probed side and answers each ping.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use natter_core::config::LivenessConfig;
use natter_core::{Envelope, MessageType};

use crate::registry::RegistryError;
use crate::service::{Env, Handler};
use crate::session::Context;

const PING_PAYLOAD: &str = "[ping]";
const PONG_PAYLOAD: &str = "[pong]";

/// Answers every ping with a pong.
#[derive(Debug, Default)]
pub struct PingHandler;

#[async_trait]
impl Handler for PingHandler {
    async fn on_message(&self, ctx: &Context, _env: &Envelope) -> anyhow::Result<()> {
        ctx.write(Envelope::new(MessageType::Pong, &PONG_PAYLOAD)?).await?;
        Ok(())
    }
}

/// Tracks pongs and evicts peers that stop answering.
pub struct PongHandler {
    monitor: Arc<Monitor>,
}

struct Monitor {
    tracked: DashMap<String, Tracked>,
    interval: Duration,
    max_no_reply: Duration,
    /// Bumped on every init and remove; a ticker exits once it no longer
    /// matches the generation it was started with.
    generation: AtomicU64,
}

struct Tracked {
    ctx: Context,
    last_pong: Instant,
}

impl PongHandler {
    pub fn new(interval: Duration, max_no_reply: Duration) -> Self {
        Self {
            monitor: Arc::new(Monitor {
                tracked: DashMap::new(),
                interval,
                max_no_reply,
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn from_config(config: &LivenessConfig) -> Self {
        Self::new(config.ping_interval(), config.max_no_reply())
    }

    pub fn is_tracked(&self, remote_addr: &str) -> bool {
        self.monitor.tracked.contains_key(remote_addr)
    }

    pub fn tracked_len(&self) -> usize {
        self.monitor.tracked.len()
    }

    /// Run one eviction and ping pass immediately.
    pub async fn sweep(&self) {
        self.monitor.sweep().await;
    }
}

impl Monitor {
    async fn sweep(&self) {
        let now = Instant::now();
        let mut expired = Vec::new();
        let mut alive = Vec::new();
        for entry in self.tracked.iter() {
            if now.duration_since(entry.last_pong) > self.max_no_reply {
                expired.push(entry.key().clone());
            } else {
                alive.push(entry.ctx.clone());
            }
        }

        for remote in expired {
            if let Some((_, tracked)) = self.tracked.remove(&remote) {
                tracing::info!(remote = %remote, "no pong within deadline, closing");
                tracked.ctx.close().await;
            }
        }

        let ping = match Envelope::new(MessageType::Ping, &PING_PAYLOAD) {
            Ok(env) => env,
            Err(e) => {
                tracing::error!(error = %e, "failed to build ping");
                return;
            }
        };
        // One task per ping, bounded by one interval.
        for ctx in alive {
            let ping = ping.clone();
            let deadline = self.interval;
            tokio::spawn(async move {
                match tokio::time::timeout(deadline, ctx.write(ping)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::debug!(remote = ctx.remote_addr(), error = %e, "ping failed")
                    }
                    Err(_) => tracing::debug!(remote = ctx.remote_addr(), "ping write stalled"),
                }
            });
        }
    }
}

async fn tick(monitor: Weak<Monitor>, interval: Duration, generation: u64) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    loop {
        ticker.tick().await;
        let Some(monitor) = monitor.upgrade() else {
            break;
        };
        if monitor.generation.load(Ordering::Acquire) != generation {
            break;
        }
        monitor.sweep().await;
    }
    tracing::debug!("liveness ticker stopped");
}

#[async_trait]
impl Handler for PongHandler {
    async fn on_message(&self, ctx: &Context, _env: &Envelope) -> anyhow::Result<()> {
        if let Some(mut tracked) = self.monitor.tracked.get_mut(ctx.remote_addr()) {
            tracked.last_pong = Instant::now();
        }
        Ok(())
    }

    async fn on_active(&self, ctx: &Context) {
        self.monitor.tracked.insert(
            ctx.remote_addr().to_string(),
            Tracked {
                ctx: ctx.clone(),
                last_pong: Instant::now(),
            },
        );
    }

    async fn on_close(&self, ctx: &Context) {
        self.monitor
            .tracked
            .remove_if(ctx.remote_addr(), |_, t| t.ctx.same_session(ctx));
    }

    fn on_init(&self, _env: &dyn Env) -> Result<(), RegistryError> {
        let generation = self.monitor.generation.fetch_add(1, Ordering::AcqRel) + 1;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(tick(
                    Arc::downgrade(&self.monitor),
                    self.monitor.interval,
                    generation,
                ));
            }
            Err(_) => tracing::warn!("no async runtime, liveness ticker not started"),
        }
        Ok(())
    }

    fn on_remove(&self, _env: &dyn Env) {
        self.monitor.generation.fetch_add(1, Ordering::AcqRel);
    }
}

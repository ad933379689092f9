//! Display handler — hands text payloads to a caller-supplied sink.

use async_trait::async_trait;
use natter_core::Envelope;

use crate::service::Handler;
use crate::session::Context;

type Sink = Box<dyn Fn(&str) + Send + Sync>;

pub struct DisplayHandler {
    sink: Sink,
}

impl DisplayHandler {
    pub fn new(sink: impl Fn(&str) + Send + Sync + 'static) -> Self {
        Self {
            sink: Box::new(sink),
        }
    }

    /// Log each line at info level.
    pub fn logging() -> Self {
        Self::new(|text| tracing::info!(text, "display"))
    }
}

#[async_trait]
impl Handler for DisplayHandler {
    async fn on_message(&self, _ctx: &Context, env: &Envelope) -> anyhow::Result<()> {
        let text: String = env.decode()?;
        (self.sink)(&text);
        Ok(())
    }
}

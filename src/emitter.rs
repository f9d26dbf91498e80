//! Event sinks.
//!
//! Pollers push [`DeltaEvent`]s into a bounded channel; a single task
//! drains it into an [`EventSink`].  Emission therefore never runs
//! inside a poll loop, and the sink has no way to touch poller state.

use std::io::{self, Write};

use async_trait::async_trait;
use log::{error, info};
use tokio::sync::mpsc;

use crate::types::DeltaEvent;

#[async_trait]
pub trait EventSink: Send {
    fn name(&self) -> &'static str;

    async fn emit(&mut self, event: &DeltaEvent) -> io::Result<()>;
}

/// One human-readable line per event.
pub struct ConsoleSink<W> {
    out: W,
}

impl ConsoleSink<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write + Send> ConsoleSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

#[async_trait]
impl<W: Write + Send> EventSink for ConsoleSink<W> {
    fn name(&self) -> &'static str {
        "console"
    }

    async fn emit(&mut self, event: &DeltaEvent) -> io::Result<()> {
        writeln!(self.out, "{}", event)?;
        self.out.flush()
    }
}

/// One JSON object per line, for piping into other tools.
pub struct JsonSink<W> {
    out: W,
}

impl JsonSink<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write + Send> JsonSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

#[async_trait]
impl<W: Write + Send> EventSink for JsonSink<W> {
    fn name(&self) -> &'static str {
        "json"
    }

    async fn emit(&mut self, event: &DeltaEvent) -> io::Result<()> {
        let line = serde_json::to_string(event)?;
        writeln!(self.out, "{}", line)?;
        self.out.flush()
    }
}

/// Drains `events` into `sink` until every sender is gone.
///
/// Returns the number of events successfully emitted.  A failed write is
/// logged and the next event is tried.
pub async fn run_emitter<S>(mut events: mpsc::Receiver<DeltaEvent>, sink: &mut S) -> u64
where
    S: EventSink + ?Sized,
{
    info!("Emitting deltas to {} sink", sink.name());
    let mut emitted = 0;

    while let Some(event) = events.recv().await {
        match sink.emit(&event).await {
            Ok(()) => emitted += 1,
            Err(e) => error!("Failed to emit {:?} to {}: {}", event, sink.name(), e),
        }
    }

    info!("Event channel closed after {} deltas, emitter shutting down", emitted);
    emitted
}

//! Output sinks
//!
//! The side-effect boundary of the runtime: every output produced during an
//! invocation is pushed to the sink immediately, and the derived output
//! watermark is published through the same interface. Watermark monotonicity
//! is enforced upstream (coordinator, merge sink); implementations here just
//! record or forward what they are given.

use crate::work_item::TaggedOutput;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::error;

/// Trait for output sinks
#[async_trait]
pub trait OutputSink: Send + Sync {
    /// Name of this sink
    fn name(&self) -> &str;

    /// Receive one tagged output record
    async fn emit(&self, output: &TaggedOutput) -> Result<()>;

    /// Receive an advanced output watermark
    async fn emit_watermark(&self, watermark: DateTime<Utc>) -> Result<()>;

    /// Flush any buffered data
    async fn flush(&self) -> Result<()>;

    /// Close the sink
    async fn close(&self) -> Result<()>;
}

/// Console sink - prints to stdout
pub struct ConsoleSink {
    name: String,
    pretty: bool,
}

impl ConsoleSink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pretty: true,
        }
    }

    pub fn compact(mut self) -> Self {
        self.pretty = false;
        self
    }
}

#[async_trait]
impl OutputSink for ConsoleSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn emit(&self, output: &TaggedOutput) -> Result<()> {
        if self.pretty {
            println!(
                "[{}] {} {} | {:?}",
                output.value.timestamp.format("%H:%M:%S"),
                output.tag,
                output.value.value.event_type,
                output.value.value.data
            );
        } else {
            println!("{}", serde_json::to_string(output)?);
        }
        Ok(())
    }

    async fn emit_watermark(&self, watermark: DateTime<Utc>) -> Result<()> {
        println!("-- watermark {}", watermark.format("%H:%M:%S%.3f"));
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// File sink - writes JSON lines to a file
pub struct FileSink {
    name: String,
    file: Arc<Mutex<File>>,
}

impl FileSink {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            name: name.into(),
            file: Arc::new(Mutex::new(file)),
        })
    }
}

#[async_trait]
impl OutputSink for FileSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn emit(&self, output: &TaggedOutput) -> Result<()> {
        let json = serde_json::to_string(output)?;
        let mut file = self.file.lock().await;
        writeln!(file, "{}", json)?;
        Ok(())
    }

    async fn emit_watermark(&self, watermark: DateTime<Utc>) -> Result<()> {
        let mut file = self.file.lock().await;
        writeln!(file, "{{\"watermark_ms\":{}}}", watermark.timestamp_millis())?;
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        let mut file = self.file.lock().await;
        file.flush()?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.flush().await
    }
}

/// In-memory sink that records everything it receives, for tests and
/// single-process inspection.
#[derive(Default)]
pub struct CollectingSink {
    outputs: std::sync::Mutex<Vec<TaggedOutput>>,
    watermarks: std::sync::Mutex<Vec<DateTime<Utc>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outputs(&self) -> Vec<TaggedOutput> {
        self.outputs.lock().expect("collecting sink lock").clone()
    }

    pub fn output_count(&self) -> usize {
        self.outputs.lock().expect("collecting sink lock").len()
    }

    pub fn watermarks(&self) -> Vec<DateTime<Utc>> {
        self.watermarks
            .lock()
            .expect("collecting sink lock")
            .clone()
    }
}

#[async_trait]
impl OutputSink for CollectingSink {
    fn name(&self) -> &str {
        "collecting"
    }

    async fn emit(&self, output: &TaggedOutput) -> Result<()> {
        self.outputs
            .lock()
            .expect("collecting sink lock")
            .push(output.clone());
        Ok(())
    }

    async fn emit_watermark(&self, watermark: DateTime<Utc>) -> Result<()> {
        self.watermarks
            .lock()
            .expect("collecting sink lock")
            .push(watermark);
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Multi-sink that broadcasts to multiple sinks
pub struct MultiSink {
    name: String,
    sinks: Vec<Box<dyn OutputSink>>,
}

impl MultiSink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sinks: Vec::new(),
        }
    }

    pub fn add(mut self, sink: Box<dyn OutputSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

#[async_trait]
impl OutputSink for MultiSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn emit(&self, output: &TaggedOutput) -> Result<()> {
        for sink in &self.sinks {
            if let Err(e) = sink.emit(output).await {
                error!("Sink {} error: {}", sink.name(), e);
            }
        }
        Ok(())
    }

    async fn emit_watermark(&self, watermark: DateTime<Utc>) -> Result<()> {
        for sink in &self.sinks {
            if let Err(e) = sink.emit_watermark(watermark).await {
                error!("Sink {} error: {}", sink.name(), e);
            }
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        for sink in &self.sinks {
            sink.flush().await?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        for sink in &self.sinks {
            sink.close().await?;
        }
        Ok(())
    }
}

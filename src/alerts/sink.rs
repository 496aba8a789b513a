use anyhow::{anyhow, Result};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use super::Alert;

/// Push-notification boundary. Implementations may block; wrap them in a
/// [`SinkWorker`] to keep them off the frame loop.
pub trait AlertSink: Send {
    fn name(&self) -> &str;
    fn send(&mut self, alert: &Alert) -> Result<()>;
    /// Flush and release any connection. Called once when the worker stops.
    fn close(&mut self) {}
}

/// Writes alerts to the log. The daemon's fallback when no broker is set.
pub struct LogSink;

impl AlertSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    fn send(&mut self, alert: &Alert) -> Result<()> {
        log::warn!(
            "[{}] {}: {} (track {}, conf {:.2})",
            alert.zone_kind.as_str(),
            alert.title,
            alert.message,
            alert.track_id,
            alert.confidence
        );
        Ok(())
    }
}

/// Collects alerts in memory.
#[derive(Default)]
pub struct MemorySink {
    received: Arc<Mutex<Vec<Alert>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn received(&self) -> Arc<Mutex<Vec<Alert>>> {
        self.received.clone()
    }
}

impl AlertSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    fn send(&mut self, alert: &Alert) -> Result<()> {
        self.received
            .lock()
            .map_err(|_| anyhow!("memory sink lock poisoned"))?
            .push(alert.clone());
        Ok(())
    }
}

/// Runs a sink on its own thread behind a bounded queue.
///
/// `submit` never blocks: a full queue drops the alert with a warning.
/// Send failures are logged and not retried.
pub struct SinkWorker {
    name: String,
    tx: Option<SyncSender<Alert>>,
    join: Option<JoinHandle<()>>,
}

impl SinkWorker {
    pub fn spawn(mut sink: Box<dyn AlertSink>, capacity: usize) -> Result<Self> {
        let name = sink.name().to_string();
        let (tx, rx) = mpsc::sync_channel::<Alert>(capacity.max(1));
        let thread_name = name.clone();
        let join = std::thread::Builder::new()
            .name(format!("alert-sink-{}", name))
            .spawn(move || {
                for alert in rx {
                    if let Err(e) = sink.send(&alert) {
                        log::warn!("alert sink {} failed for {}: {}", thread_name, alert.id, e);
                    }
                }
                sink.close();
            })
            .map_err(|e| anyhow!("failed to spawn alert sink {}: {}", name, e))?;
        Ok(Self {
            name,
            tx: Some(tx),
            join: Some(join),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue an alert. Returns false when it was dropped.
    pub fn submit(&self, alert: Alert) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        match tx.try_send(alert) {
            Ok(()) => true,
            Err(TrySendError::Full(alert)) => {
                log::warn!("alert sink {} queue full, dropping {}", self.name, alert.id);
                false
            }
            Err(TrySendError::Disconnected(alert)) => {
                log::warn!("alert sink {} stopped, dropping {}", self.name, alert.id);
                false
            }
        }
    }
}

impl Drop for SinkWorker {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                log::warn!("alert sink {} panicked", self.name);
            }
        }
    }
}

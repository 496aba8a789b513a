//! One inference thread per backend.
//!
//! The orchestrator hands every enabled worker the same frame and waits on a
//! per-frame reply channel with a deadline. A reply that arrives after the
//! frame moved on lands on a dropped receiver and is discarded.

use anyhow::{anyhow, Result};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::detect::backend::{CancelToken, DetectParams, DetectorBackend};
use crate::detect::result::Detection;
use crate::error::PipelineError;
use crate::frame::Frame;

struct Job {
    frame: Frame,
    params: DetectParams,
    reply: Sender<WorkerReply>,
}

/// Result of one backend call for one frame.
#[derive(Debug)]
pub struct WorkerReply {
    pub backend_id: String,
    pub seq: u64,
    pub outcome: Result<Vec<Detection>>,
    pub elapsed: Duration,
}

pub struct BackendWorker {
    id: String,
    tx: Mutex<Option<Sender<Job>>>,
    cancel: CancelToken,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl BackendWorker {
    pub fn spawn(id: String, mut backend: Box<dyn DetectorBackend>) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<Job>();
        let cancel = CancelToken::new();
        let thread_cancel = cancel.clone();
        let thread_id = id.clone();
        let join = std::thread::Builder::new()
            .name(format!("backend-{}", id))
            .spawn(move || {
                if let Err(e) = backend.warm_up() {
                    log::warn!("backend {} warm-up failed: {}", thread_id, e);
                }
                run_jobs(&thread_id, backend.as_mut(), rx, &thread_cancel);
                backend.release();
                log::debug!("backend {} released", thread_id);
            })
            .map_err(|e| anyhow!("failed to spawn worker for {}: {}", id, e))?;
        Ok(Self {
            id,
            tx: Mutex::new(Some(tx)),
            cancel,
            join: Mutex::new(Some(join)),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Queue a frame. Fails when the worker has stopped.
    pub fn dispatch(
        &self,
        frame: Frame,
        params: &DetectParams,
        reply: Sender<WorkerReply>,
    ) -> Result<()> {
        let guard = self
            .tx
            .lock()
            .map_err(|_| anyhow!("worker {} lock poisoned", self.id))?;
        let tx = guard
            .as_ref()
            .ok_or_else(|| anyhow!("worker {} stopped", self.id))?;
        let params = DetectParams {
            cancel: self.cancel.clone(),
            ..params.clone()
        };
        tx.send(Job {
            frame,
            params,
            reply,
        })
        .map_err(|_| anyhow!("worker {} exited", self.id))
    }

    /// Cancel any in-flight call, stop the thread, and wait for the backend to release.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
        let join = self.join.lock().ok().and_then(|mut j| j.take());
        if let Some(join) = join {
            if join.join().is_err() {
                log::warn!("backend {} worker panicked", self.id);
            }
        }
    }
}

impl Drop for BackendWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_jobs(
    id: &str,
    backend: &mut dyn DetectorBackend,
    rx: Receiver<Job>,
    cancel: &CancelToken,
) {
    while let Ok(mut job) = rx.recv() {
        // Only the newest queued frame matters.
        while let Ok(newer) = rx.try_recv() {
            job = newer;
        }
        if cancel.is_cancelled() {
            break;
        }
        let started = Instant::now();
        // A panicking backend loses this frame only; the thread keeps serving.
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            backend.detect(&job.frame, &job.params)
        }))
        .unwrap_or_else(|payload| {
            let reason = panic_reason(payload.as_ref());
            log::error!("backend {} panicked on frame {}: {}", id, job.frame.seq, reason);
            Err(PipelineError::BackendUnavailable {
                backend: id.to_string(),
                reason: format!("panicked: {}", reason),
            }
            .into())
        })
        .map(|mut dets| {
            for det in &mut dets {
                det.backend_id = id.to_string();
            }
            dets
        });
        let _ = job.reply.send(WorkerReply {
            backend_id: id.to_string(),
            seq: job.frame.seq,
            outcome,
            elapsed: started.elapsed(),
        });
    }
}

fn panic_reason(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

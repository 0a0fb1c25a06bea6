//! Single-worker job queue
//!
//! Jobs are processed one at a time in submission order. Each job runs on the
//! blocking pool and the worker waits for it before pulling the next one, so
//! at most one raster is being processed at any moment. A running job cannot
//! be cancelled; callers observe it through its handle or the progress hub.

use crate::core::pipeline::{Pipeline, ProcessingSummary};
use crate::types::{AccessError, AccessResult, ImageId};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tokio::sync::oneshot;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

#[derive(Debug)]
enum JobMessage {
    Process {
        image_id: ImageId,
        reply: oneshot::Sender<AccessResult<ProcessingSummary>>,
    },
    Exit,
}

/// Pending result of a submitted job
#[derive(Debug)]
pub struct JobHandle {
    image_id: ImageId,
    reply: oneshot::Receiver<AccessResult<ProcessingSummary>>,
}

impl JobHandle {
    pub fn image_id(&self) -> ImageId {
        self.image_id
    }

    pub async fn wait(self) -> AccessResult<ProcessingSummary> {
        self.reply
            .await
            .map_err(|_| AccessError::Job(format!("Worker dropped the job for image {}", self.image_id)))?
    }
}

pub struct JobQueue {
    tx: Mutex<Option<Sender<JobMessage>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl JobQueue {
    /// Spawn the worker on the current tokio runtime; fails outside one
    pub fn start(pipeline: Arc<Pipeline>, capacity: usize) -> AccessResult<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| AccessError::Job(format!("Job queue needs a tokio runtime: {}", e)))?;
        let (tx, rx) = channel::<JobMessage>(capacity.max(1));
        let worker = runtime.spawn(worker_loop(rx, pipeline));
        log::info!("Job queue started (capacity {})", capacity.max(1));

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    fn sender(&self) -> AccessResult<Sender<JobMessage>> {
        self.tx
            .lock()
            .clone()
            .ok_or_else(|| AccessError::Job("Job queue is shut down".to_string()))
    }

    /// Queue an image, waiting for space when the queue is full
    pub async fn submit(&self, image_id: ImageId) -> AccessResult<JobHandle> {
        let (reply, receiver) = oneshot::channel();
        self.sender()?
            .send(JobMessage::Process { image_id, reply })
            .await
            .map_err(|_| AccessError::Job("Job worker has stopped".to_string()))?;
        log::debug!("Queued image {}", image_id);
        Ok(JobHandle { image_id, reply: receiver })
    }

    /// Queue an image without waiting; fails when the queue is full
    pub fn try_submit(&self, image_id: ImageId) -> AccessResult<JobHandle> {
        let (reply, receiver) = oneshot::channel();
        match self.sender()?.try_send(JobMessage::Process { image_id, reply }) {
            Ok(()) => Ok(JobHandle { image_id, reply: receiver }),
            Err(TrySendError::Full(_)) => Err(AccessError::Job(format!("Job queue is full, image {} rejected", image_id))),
            Err(TrySendError::Closed(_)) => Err(AccessError::Job("Job worker has stopped".to_string())),
        }
    }

    /// Finish every queued job, then stop the worker
    pub async fn shutdown(&self) -> AccessResult<()> {
        let tx = self.tx.lock().take();
        if let Some(tx) = tx {
            // fails only when the worker is already gone
            let _ = tx.send(JobMessage::Exit).await;
        }

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            worker
                .await
                .map_err(|e| AccessError::Job(format!("Job worker failed: {}", e)))?;
        }
        log::info!("Job queue stopped");
        Ok(())
    }
}

impl Drop for JobQueue {
    fn drop(&mut self) {
        if self.worker.get_mut().is_some() {
            log::warn!("Job queue dropped without shutdown; queued jobs may be lost");
        }
    }
}

async fn worker_loop(mut rx: Receiver<JobMessage>, pipeline: Arc<Pipeline>) {
    while let Some(msg) = rx.recv().await {
        let (image_id, reply) = match msg {
            JobMessage::Process { image_id, reply } => (image_id, reply),
            JobMessage::Exit => break,
        };

        let job_pipeline = Arc::clone(&pipeline);
        let result = match tokio::task::spawn_blocking(move || job_pipeline.process_image(image_id)).await {
            Ok(result) => result,
            Err(e) => {
                log::error!("Job for image {} panicked: {}", image_id, e);
                pipeline.mark_failed(image_id);
                Err(AccessError::Job(format!("Job for image {} panicked", image_id)))
            }
        };

        if reply.send(result).is_err() {
            log::debug!("Result of image {} had no waiting caller", image_id);
        }
    }
}

//! Job progress: the stage machine, per-image pub/sub, and the per-job
//! reporter that persists and broadcasts status changes.

use crate::io::catalog::Catalog;
use crate::types::{AccessResult, ImageId, STATUS_COMPLETE, STATUS_FAILED};
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::broadcast;

const TOPIC_CAPACITY: usize = 64;

/// Stages of one processing job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingStage {
    Pending,
    BoundsResolved,
    OverviewRendered,
    PerPolygon { processed: usize, total: usize },
    Finalizing,
    Done,
    Failed,
}

impl ProcessingStage {
    /// Externally observed status value
    pub fn progress(&self) -> i32 {
        match *self {
            ProcessingStage::Pending => 0,
            ProcessingStage::BoundsResolved => 25,
            ProcessingStage::OverviewRendered => 50,
            ProcessingStage::PerPolygon { processed, total } => {
                if total == 0 {
                    75
                } else {
                    50 + (25 * processed.min(total) / total) as i32
                }
            }
            ProcessingStage::Finalizing => 75,
            ProcessingStage::Done => STATUS_COMPLETE,
            ProcessingStage::Failed => STATUS_FAILED,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessingStage::Done | ProcessingStage::Failed)
    }
}

/// Topic-per-image progress fan-out
#[derive(Default)]
pub struct ProgressHub {
    topics: Mutex<HashMap<ImageId, broadcast::Sender<i32>>>,
}

impl ProgressHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send a status to every current subscriber of `image_id`.
    /// Topics nobody listens to are dropped; publishing to them is a no-op.
    /// A terminal status (100 or -1) closes the topic after delivery.
    pub fn publish(&self, image_id: ImageId, status: i32) {
        let mut topics = self.topics.lock();
        let Some(sender) = topics.get(&image_id) else {
            return;
        };

        if sender.receiver_count() == 0 || sender.send(status).is_err() {
            topics.remove(&image_id);
            return;
        }
        log::debug!("Broadcast progress {} for image {}", status, image_id);

        if status == STATUS_COMPLETE || status == STATUS_FAILED {
            topics.remove(&image_id);
        }
    }

    /// Attach to an image's progress; dropping the subscription detaches
    pub fn subscribe(&self, image_id: ImageId) -> ProgressSubscription {
        let mut topics = self.topics.lock();
        let receiver = topics
            .entry(image_id)
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .subscribe();
        ProgressSubscription { image_id, receiver }
    }

    pub fn subscriber_count(&self, image_id: ImageId) -> usize {
        self.topics
            .lock()
            .get(&image_id)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }
}

/// Stream of status values for one image
pub struct ProgressSubscription {
    image_id: ImageId,
    receiver: broadcast::Receiver<i32>,
}

impl ProgressSubscription {
    pub fn image_id(&self) -> ImageId {
        self.image_id
    }

    /// Next status, or `None` once the job has finished and the topic is closed.
    /// A slow subscriber skips values it missed rather than failing.
    pub async fn recv(&mut self) -> Option<i32> {
        loop {
            match self.receiver.recv().await {
                Ok(status) => return Some(status),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("Progress subscriber for image {} lagged by {}", self.image_id, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Persists every stage change of one job and broadcasts strictly increasing values
pub struct ProgressReporter<'a> {
    image_id: ImageId,
    catalog: &'a dyn Catalog,
    hub: &'a ProgressHub,
    last_broadcast: Option<i32>,
}

impl<'a> ProgressReporter<'a> {
    pub fn new(image_id: ImageId, catalog: &'a dyn Catalog, hub: &'a ProgressHub) -> Self {
        Self {
            image_id,
            catalog,
            hub,
            last_broadcast: None,
        }
    }

    pub fn report(&mut self, stage: ProcessingStage) -> AccessResult<()> {
        let status = stage.progress();
        self.catalog.update_processing_status(self.image_id, status)?;

        let advances = self.last_broadcast.map_or(true, |last| status > last);
        if advances || stage.is_terminal() {
            self.hub.publish(self.image_id, status);
            self.last_broadcast = Some(status);
        }
        Ok(())
    }

    /// Mark the job failed. Persisting is best effort since the job is already failing.
    pub fn fail(&mut self) {
        if let Err(e) = self.catalog.update_processing_status(self.image_id, STATUS_FAILED) {
            log::error!("Could not persist failure of image {}: {}", self.image_id, e);
        }
        self.hub.publish(self.image_id, STATUS_FAILED);
        self.last_broadcast = Some(STATUS_FAILED);
    }
}

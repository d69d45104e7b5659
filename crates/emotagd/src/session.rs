//! Session context: the capture loop, the topic store and the push channel.
//!
//! Every public method is synchronous and may block (start/stop wait on the
//! capture thread); async callers go through `spawn_blocking`.

use crate::capture::{
    CaptureError, CaptureLoop, CaptureMonitor, CaptureState, Health, LoopSettings, Pipeline,
};
use emotag_core::store::{by_display_name, normalize_topic};
use emotag_core::{classify, Classification, Snapshot, TaggedScore, TaggedSnapshot, TopicStore};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::broadcast;

/// How long a tag request that had to start capture waits for the first snapshot.
const FIRST_SNAPSHOT_WAIT: Duration = Duration::from_secs(2);
const FIRST_SNAPSHOT_POLL: Duration = Duration::from_millis(10);
const UPDATE_CHANNEL_CAPACITY: usize = 16;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("device unavailable")]
    DeviceUnavailable(#[source] CaptureError),
    #[error("no data yet")]
    NoData,
    #[error("stop timed out")]
    StopTimeout(#[source] CaptureError),
}

impl From<CaptureError> for SessionError {
    fn from(e: CaptureError) -> Self {
        match e {
            CaptureError::StopTimeout(_) => SessionError::StopTimeout(e),
            other => SessionError::DeviceUnavailable(other),
        }
    }
}

/// Result of tagging the live snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct TagSummary {
    pub num_faces: usize,
    pub emotions: Vec<Vec<TaggedScore>>,
    pub topic: Option<String>,
    /// Snapshots now filed under `topic`; 0 for untagged reads.
    pub total_snapshots_for_topic: usize,
}

/// Everything a session collected, handed back when collection stops.
#[derive(Debug, Clone, Serialize)]
pub struct CollectionResult {
    pub total_topics: usize,
    pub collected_data: BTreeMap<String, Vec<TaggedSnapshot>>,
    pub classification: Classification,
    /// Set when capture did not stop cleanly; the data above is still complete.
    pub stop_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CaptureStatus {
    pub state: CaptureState,
    pub health: Health,
    pub frames_processed: u64,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub has_live_snapshot: bool,
    pub total_topics: usize,
}

pub struct Session {
    /// Held across a tag's read-and-append and across stop-collection's stop-and-drain,
    /// so a tag never lands in a store that has already been handed back.
    collection: Mutex<()>,
    capture: Mutex<CaptureLoop>,
    monitor: CaptureMonitor,
    store: TopicStore,
    updates: broadcast::Sender<Classification>,
}

impl Session {
    pub fn new(pipeline: Pipeline, settings: LoopSettings) -> Self {
        let capture = CaptureLoop::new(pipeline, settings);
        let monitor = capture.monitor();
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            collection: Mutex::new(()),
            capture: Mutex::new(capture),
            monitor,
            store: TopicStore::new(),
            updates,
        }
    }

    fn capture(&self) -> MutexGuard<'_, CaptureLoop> {
        self.capture.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn collection(&self) -> MutexGuard<'_, ()> {
        self.collection.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Start sampling. Succeeds without side effects if already running.
    pub fn start_capture(&self) -> Result<(), SessionError> {
        self.capture().start().map_err(|e| {
            tracing::warn!(error = %e, "start capture failed");
            SessionError::from(e)
        })
    }

    /// Read the live snapshot, stamp it with `topic` and, for a real topic, file it.
    ///
    /// Starts capture on demand. A blank or absent topic is an untagged read:
    /// scores carry `"none"` and the store is not touched.
    pub fn tag_current(&self, topic: Option<&str>) -> Result<TagSummary, SessionError> {
        let _collection = self.collection();
        let snapshot = match self.monitor.live_snapshot() {
            Some(s) => s,
            None if self.monitor.is_running() => return Err(SessionError::NoData),
            None => {
                self.start_capture()?;
                self.wait_for_first_snapshot().ok_or(SessionError::NoData)?
            }
        };

        // Report the topic under the spelling the store files it as.
        let (topic, total_snapshots_for_topic) = match normalize_topic(topic) {
            Some(t) => {
                let (display, n) = self.store.append(t, &snapshot);
                tracing::info!(
                    topic = %display,
                    faces = snapshot.num_faces,
                    total = n,
                    "tagged snapshot"
                );
                self.offer(classify(&self.store.frozen()));
                (Some(display), n)
            }
            None => (None, 0),
        };

        Ok(TagSummary {
            num_faces: snapshot.num_faces,
            emotions: snapshot.stamped(topic.as_deref()),
            topic,
            total_snapshots_for_topic,
        })
    }

    fn wait_for_first_snapshot(&self) -> Option<Arc<Snapshot>> {
        let deadline = Instant::now() + FIRST_SNAPSHOT_WAIT;
        loop {
            if let Some(s) = self.monitor.live_snapshot() {
                return Some(s);
            }
            if Instant::now() >= deadline || !self.monitor.is_running() {
                return None;
            }
            std::thread::sleep(FIRST_SNAPSHOT_POLL);
        }
    }

    pub fn live_snapshot(&self) -> Option<Arc<Snapshot>> {
        self.monitor.live_snapshot()
    }

    /// Classify the current store without modifying it.
    pub fn classify(&self) -> Classification {
        classify(&self.store.frozen())
    }

    /// Stop capture, drain the store and return it with its final classification.
    ///
    /// A stop timeout does not lose the collected data: it is logged, reported
    /// in `stop_error` and `status().last_error`, and the result is still returned.
    pub fn stop_collection(&self) -> CollectionResult {
        let _collection = self.collection();
        let stop_error = self.capture().stop().err().map(|e| {
            tracing::error!(error = %e, "capture did not stop cleanly; returning data anyway");
            SessionError::from(e).to_string()
        });

        let drained = self.store.drain();
        let classification = classify(&drained);
        self.offer(classification.clone());

        let result = CollectionResult {
            total_topics: drained.len(),
            collected_data: by_display_name(drained),
            classification,
            stop_error,
        };
        tracing::info!(
            topics = result.total_topics,
            good = result.classification.good_topics.len(),
            bad = result.classification.bad_topics.len(),
            "collection stopped"
        );
        result
    }

    pub fn status(&self) -> CaptureStatus {
        let loop_status = self.monitor.status();
        CaptureStatus {
            state: loop_status.state,
            health: loop_status.health,
            frames_processed: loop_status.frames_processed,
            consecutive_failures: loop_status.consecutive_failures,
            last_error: loop_status.last_error,
            has_live_snapshot: self.monitor.live_snapshot().is_some(),
            total_topics: self.store.topic_count(),
        }
    }

    /// Receive every classification pushed after a tag or a stop-collection.
    pub fn subscribe(&self) -> broadcast::Receiver<Classification> {
        self.updates.subscribe()
    }

    fn offer(&self, classification: Classification) {
        // No subscribers is fine.
        let _ = self.updates.send(classification);
    }

    /// Stop capture and release the device. The store is left as is.
    pub fn shutdown(&self) -> Result<(), SessionError> {
        tracing::info!("session shutting down");
        self.capture().stop().map_err(SessionError::from)
    }
}

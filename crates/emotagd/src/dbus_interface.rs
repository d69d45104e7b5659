use crate::session::{Session, SessionError};
use emotag_core::Classification;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use zbus::interface;
use zbus::object_server::{InterfaceRef, SignalEmitter};

pub const BUS_NAME: &str = "org.emotag.Emotag1";
pub const OBJECT_PATH: &str = "/org/emotag/Emotag1";

/// D-Bus interface for the emotag daemon.
///
/// Bus name: org.emotag.Emotag1
/// Object path: /org/emotag/Emotag1
///
/// Every method returns a JSON document. Session operations that wait on the
/// capture thread run on the blocking pool.
pub struct EmotagService {
    session: Arc<Session>,
    device: String,
}

impl EmotagService {
    pub fn new(session: Arc<Session>, device: impl Into<String>) -> Self {
        Self {
            session,
            device: device.into(),
        }
    }

    async fn blocking<T, F>(&self, op: &'static str, f: F) -> zbus::fdo::Result<T>
    where
        F: FnOnce(&Session) -> Result<T, SessionError> + Send + 'static,
        T: Send + 'static,
    {
        let session = Arc::clone(&self.session);
        tokio::task::spawn_blocking(move || f(&session))
            .await
            .map_err(|e| zbus::fdo::Error::Failed(format!("{op} task failed: {e}")))?
            .map_err(|e| {
                tracing::warn!(
                    op,
                    error = %e,
                    source = ?std::error::Error::source(&e),
                    "request failed"
                );
                zbus::fdo::Error::Failed(e.to_string())
            })
    }
}

fn to_json<T: Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value)
        .map_err(|e| zbus::fdo::Error::Failed(format!("serialization failed: {e}")))
}

#[interface(name = "org.emotag.Emotag1")]
impl EmotagService {
    /// Open the camera and start sampling. Idempotent.
    async fn start_capture(&self) -> zbus::fdo::Result<String> {
        tracing::info!("start_capture requested");
        self.blocking("start_capture", |s| s.start_capture()).await?;
        Ok(serde_json::json!({ "status": "running" }).to_string())
    }

    /// Tag the live snapshot with `topic`; an empty string reads without tagging.
    async fn tag_current(&self, topic: &str) -> zbus::fdo::Result<String> {
        tracing::debug!(topic, "tag_current requested");
        let topic = topic.to_string();
        let summary = self
            .blocking("tag_current", move |s| s.tag_current(Some(&topic)))
            .await?;
        to_json(&summary)
    }

    /// The most recent snapshot, or an empty one before the first frame.
    async fn live_snapshot(&self) -> zbus::fdo::Result<String> {
        let body = match self.session.live_snapshot() {
            Some(snap) => serde_json::json!({
                "num_faces": snap.num_faces,
                "emotions": snap.faces,
                "captured_at": snap.captured_at,
            }),
            None => serde_json::json!({ "num_faces": 0, "emotions": [] }),
        };
        Ok(body.to_string())
    }

    /// Good/bad verdicts for every topic tagged so far.
    async fn classify(&self) -> zbus::fdo::Result<String> {
        to_json(&self.session.classify())
    }

    /// Stop capture and return (and clear) everything collected.
    async fn stop_collection(&self) -> zbus::fdo::Result<String> {
        tracing::info!("stop_collection requested");
        let result = self
            .blocking("stop_collection", |s| Ok(s.stop_collection()))
            .await?;
        to_json(&result)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let mut body = serde_json::to_value(self.session.status())
            .map_err(|e| zbus::fdo::Error::Failed(format!("serialization failed: {e}")))?;
        if let Some(map) = body.as_object_mut() {
            map.insert("version".into(), env!("CARGO_PKG_VERSION").into());
            map.insert("camera".into(), self.device.clone().into());
        }
        Ok(body.to_string())
    }

    /// Emitted with the new classification after every tag and stop-collection.
    #[zbus(signal)]
    async fn classification_updated(
        emitter: &SignalEmitter<'_>,
        classification: &str,
    ) -> zbus::Result<()>;
}

/// Relay classification updates as `ClassificationUpdated` signals until the session closes.
pub async fn forward_updates(
    mut updates: broadcast::Receiver<Classification>,
    iface: InterfaceRef<EmotagService>,
) {
    loop {
        match updates.recv().await {
            Ok(classification) => {
                let payload = match serde_json::to_string(&classification) {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to serialize classification update");
                        continue;
                    }
                };
                if let Err(e) =
                    EmotagService::classification_updated(iface.signal_emitter(), &payload).await
                {
                    tracing::warn!(error = %e, "failed to emit ClassificationUpdated");
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "classification updates lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    tracing::debug!("classification forwarder exiting");
}

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod capture;
mod config;
mod dbus_interface;
mod session;
#[cfg(test)]
mod testing;

use capture::{LoopSettings, Pipeline};
use dbus_interface::{EmotagService, BUS_NAME, OBJECT_PATH};
use emotag_core::{OnnxEmotionClassifier, ScrfdDetector};
use emotag_hw::Camera;
use session::Session;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("emotagd starting");

    let config = config::Config::load().context("failed to load configuration")?;
    tracing::info!(
        device = %config.camera_device,
        model_dir = %config.model_dir.display(),
        interval = ?config.frame_interval,
        "configuration loaded"
    );

    // Models load up front so a missing file fails startup, not the first request.
    let detector_path = config.detector_model_path();
    let detector = ScrfdDetector::load(&detector_path, config.detector_threshold)
        .with_context(|| format!("failed to load face detector from {detector_path}"))?;
    tracing::info!(path = %detector_path, "SCRFD detector loaded");

    let expression_path = config.expression_model_path();
    let classifier = OnnxEmotionClassifier::load(
        &expression_path,
        config.emotion_labels.clone(),
        config.face_input_size,
    )
    .with_context(|| format!("failed to load expression model from {expression_path}"))?;
    tracing::info!(
        path = %expression_path,
        labels = config.emotion_labels.len(),
        "expression model loaded"
    );

    // The camera is opened lazily by StartCapture.
    let pipeline = Pipeline {
        source: Box::new(Camera::new(config.camera_device.clone())),
        detector: Box::new(detector),
        classifier: Box::new(classifier),
    };
    let session = Arc::new(Session::new(pipeline, LoopSettings::from(&config)));

    let service = EmotagService::new(Arc::clone(&session), config.camera_device.clone());
    let conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on the session bus")?;

    let iface = conn
        .object_server()
        .interface::<_, EmotagService>(OBJECT_PATH)
        .await?;
    let forwarder = tokio::spawn(dbus_interface::forward_updates(session.subscribe(), iface));

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "emotagd ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("emotagd shutting down");

    forwarder.abort();
    let shutdown = tokio::task::spawn_blocking(move || session.shutdown()).await?;
    if let Err(e) = shutdown {
        tracing::error!(error = %e, "capture did not shut down cleanly");
    }

    Ok(())
}

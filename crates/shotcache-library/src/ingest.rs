//! Upload ingestion queue
//!
//! The upload handler writes the file into the game's image directory for the
//! configured [`ImageLayout`](crate::ImageLayout) (`<root>/<AppId>/<Filename>`
//! when flat, `<root>/<AppId>/screenshots/<Filename>` when nested) and then
//! queues a [`NewImage`]. A single worker probes queued files off the async
//! runtime and adds them to the index. The queue only speeds things up: a
//! notification lost to a restart is picked up by the next scan.

use crate::index::GameImageIndex;
use crate::probe::{ImageProber, ProbeError, ProbeOutcome};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Invalid upload {field}: {value:?}")]
    InvalidName { field: &'static str, value: String },

    #[error("Ingestion queue is full")]
    QueueFull,

    #[error("Ingestion worker has stopped")]
    Closed,

    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error("Probe task failed: {0}")]
    Task(String),
}

/// Notification that an uploaded file is on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewImage {
    #[serde(rename = "AppId")]
    pub app_id: String,
    #[serde(rename = "Filename")]
    pub filename: String,
}

impl NewImage {
    pub fn new(app_id: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            filename: filename.into(),
        }
    }

    /// Reject ids and file names that would resolve outside their game
    /// directory or that a scan would ignore
    pub fn validate(&self) -> Result<(), IngestError> {
        check_component("app id", &self.app_id)?;
        check_component("filename", &self.filename)
    }
}

fn check_component(field: &'static str, value: &str) -> Result<(), IngestError> {
    let invalid = || IngestError::InvalidName {
        field,
        value: value.to_string(),
    };

    if value.is_empty() || value.starts_with('.') || value.contains(['/', '\\']) {
        return Err(invalid());
    }
    let mut components = Path::new(value).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(invalid()),
    }
}

/// Producer side, held by the upload handler
#[derive(Debug, Clone)]
pub struct IngestSender {
    tx: mpsc::Sender<NewImage>,
}

impl IngestSender {
    /// Queue an upload, waiting for room if the queue is full
    pub async fn submit(&self, image: NewImage) -> Result<(), IngestError> {
        image.validate()?;
        self.tx.send(image).await.map_err(|_| IngestError::Closed)
    }

    /// Queue an upload without waiting
    pub fn try_submit(&self, image: NewImage) -> Result<(), IngestError> {
        image.validate()?;
        self.tx.try_send(image).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => IngestError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => IngestError::Closed,
        })
    }
}

/// Consumer side: probes queued uploads and adds them to the index
#[derive(Debug)]
pub struct IngestWorker {
    rx: mpsc::Receiver<NewImage>,
    index: Arc<GameImageIndex>,
    prober: Arc<ImageProber>,
}

/// Constructor for a bounded sender/worker pair
#[derive(Debug)]
pub struct IngestQueue;

impl IngestQueue {
    /// A queue holding at most `capacity` pending uploads (minimum one)
    pub fn new(
        capacity: usize,
        index: Arc<GameImageIndex>,
        prober: Arc<ImageProber>,
    ) -> (IngestSender, IngestWorker) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (IngestSender { tx }, IngestWorker { rx, index, prober })
    }
}

impl IngestWorker {
    /// Process uploads until every sender is dropped.
    ///
    /// Returns the number of images added to the index. Failures are logged
    /// and skipped.
    pub async fn run(self) -> usize {
        let (_running, stop) = watch::channel(false);
        self.run_until(stop).await
    }

    /// Like [`run`](Self::run), but also stops when `stop` changes.
    ///
    /// On stop the queue is closed, so further submits fail with
    /// [`IngestError::Closed`], and uploads already queued are processed
    /// before returning.
    pub async fn run_until(mut self, mut stop: watch::Receiver<bool>) -> usize {
        tracing::info!("Ingestion worker started");
        let mut added = 0;
        loop {
            tokio::select! {
                image = self.rx.recv() => match image {
                    Some(image) => added += self.handle(image).await,
                    None => break,
                },
                _ = stop.changed() => {
                    self.rx.close();
                    let mut drained = 0;
                    while let Some(image) = self.rx.recv().await {
                        drained += 1;
                        added += self.handle(image).await;
                    }
                    if drained > 0 {
                        tracing::info!("Processed {} queued uploads before stopping", drained);
                    }
                    break;
                }
            }
        }
        tracing::info!("Ingestion worker stopped after {} images", added);
        added
    }

    /// Ingest one upload, logging the outcome. Returns 1 if it was added.
    async fn handle(&self, image: NewImage) -> usize {
        match self.ingest(image.clone()).await {
            Ok(true) => 1,
            Ok(false) => {
                tracing::debug!("[{}] {} is not an indexed image", image.app_id, image.filename);
                0
            }
            Err(err) => {
                tracing::warn!("[{}] {} not ingested: {}", image.app_id, image.filename, err);
                0
            }
        }
    }

    /// Probe one upload and add it to the index. Returns whether it was added.
    pub async fn ingest(&self, image: NewImage) -> Result<bool, IngestError> {
        image.validate()?;

        let prober = Arc::clone(&self.prober);
        let root = self.index.root().to_path_buf();
        let (app_id, filename) = (image.app_id.clone(), image.filename.clone());
        let outcome =
            tokio::task::spawn_blocking(move || prober.probe(&root, &app_id, &filename))
                .await
                .map_err(|err| IngestError::Task(err.to_string()))??;

        match outcome {
            ProbeOutcome::Indexed(meta) => {
                self.index.add_or_update(&image.app_id, &image.filename, meta);
                tracing::info!("[{}] {} added", image.app_id, image.filename);
                Ok(true)
            }
            ProbeOutcome::Unsupported => Ok(false),
        }
    }
}

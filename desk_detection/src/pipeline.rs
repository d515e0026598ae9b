use crate::{
    annotator::{annotated_path, Annotator},
    error::DetectionError,
    model_service::ModelService,
    registry::ClassRegistry,
    tally::{tally, TallyVector},
};
use image::{DynamicImage, ImageReader};
use serde::Serialize;
use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};

const RUNNING: u8 = 0;
const COMMITTED: u8 = 1;
const ABANDONED: u8 = 2;

/// Decides, exactly once, whether a worker publishes its output or its caller
/// has given up on it.
#[derive(Debug, Clone)]
struct CommitGate {
    state: Arc<AtomicU8>,
}

impl CommitGate {
    fn new() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(RUNNING)),
        }
    }

    fn try_commit(&self) -> bool {
        self.state
            .compare_exchange(RUNNING, COMMITTED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn abandon(&self) -> bool {
        self.state
            .compare_exchange(RUNNING, ABANDONED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn is_abandoned(&self) -> bool {
        self.state.load(Ordering::Acquire) == ABANDONED
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DetectionOutcome {
    pub annotated_image_path: PathBuf,
    pub tally: TallyVector,
}

/// Decodes by content; the extension is never consulted.
pub fn load_image(path: &Path) -> Result<DynamicImage, DetectionError> {
    let decode_error = |source| DetectionError::ImageDecode {
        path: path.to_path_buf(),
        source,
    };

    ImageReader::open(path)
        .map_err(|e| decode_error(image::ImageError::IoError(e)))?
        .with_guessed_format()
        .map_err(|e| decode_error(image::ImageError::IoError(e)))?
        .decode()
        .map_err(decode_error)
}

/// Image in, annotated image and tally out. Holds only shared, read-only
/// state, so clones are cheap and may run concurrently.
pub struct Pipeline<M: ModelService> {
    model_service: Arc<M>,
    registry: Arc<ClassRegistry>,
    annotator: Arc<Annotator>,
}

impl<M: ModelService> Clone for Pipeline<M> {
    fn clone(&self) -> Self {
        Self {
            model_service: self.model_service.clone(),
            registry: self.registry.clone(),
            annotator: self.annotator.clone(),
        }
    }
}

impl<M: ModelService> Pipeline<M> {
    pub fn new(model_service: M, registry: ClassRegistry, annotator: Annotator) -> Self {
        Self {
            model_service: Arc::new(model_service),
            registry: Arc::new(registry),
            annotator: Arc::new(annotator),
        }
    }

    pub fn registry(&self) -> &ClassRegistry {
        &self.registry
    }

    pub fn detect(
        &self,
        image_path: &Path,
        output_dir: &Path,
        confidence_threshold: f32,
    ) -> Result<DetectionOutcome, DetectionError> {
        self.run(image_path, output_dir, confidence_threshold, &CommitGate::new())
    }

    /// Runs [`Pipeline::detect`] on the blocking pool and gives up after
    /// `limit`. A call that times out leaves no annotated image behind.
    ///
    /// The model call cannot be interrupted: an abandoned worker keeps its
    /// blocking thread until inference returns, and shutting down the tokio
    /// runtime waits for it.
    pub async fn detect_with_timeout(
        &self,
        image_path: PathBuf,
        output_dir: PathBuf,
        confidence_threshold: f32,
        limit: Duration,
    ) -> Result<DetectionOutcome, DetectionError> {
        let gate = CommitGate::new();
        let worker_gate = gate.clone();
        let pipeline = self.clone();

        let mut handle = tokio::task::spawn_blocking(move || {
            pipeline.run(&image_path, &output_dir, confidence_threshold, &worker_gate)
        });

        match tokio::time::timeout(limit, &mut handle).await {
            Ok(joined) => joined.map_err(|e| {
                DetectionError::Inference(format!("detection worker failed: {}", e))
            })?,
            Err(_) if gate.abandon() => {
                tracing::warn!("Detection timed out after {:?}", limit);
                Err(DetectionError::InferenceTimeout(limit))
            }
            Err(_) => {
                // The worker committed first; its rename is already under way.
                handle.await.map_err(|e| {
                    DetectionError::Inference(format!("detection worker failed: {}", e))
                })?
            }
        }
    }

    #[tracing::instrument(skip(self, gate))]
    fn run(
        &self,
        image_path: &Path,
        output_dir: &Path,
        confidence_threshold: f32,
        gate: &CommitGate,
    ) -> Result<DetectionOutcome, DetectionError> {
        if !(0.0..=1.0).contains(&confidence_threshold) {
            return Err(DetectionError::InvalidThreshold(confidence_threshold));
        }

        let image = load_image(image_path)?;

        std::fs::create_dir_all(output_dir)
            .map_err(|e| DetectionError::write(output_dir, e))?;

        if gate.is_abandoned() {
            return Err(DetectionError::Abandoned);
        }

        let detections =
            self.model_service
                .infer(&image, confidence_threshold, self.registry.class_ids())?;
        let tally = tally(&detections, &self.registry)?;

        let canvas = self.annotator.render(&image, &detections);
        let staged = self
            .annotator
            .stage(&canvas, annotated_path(image_path, output_dir))?;

        if !gate.try_commit() {
            return Err(DetectionError::Abandoned);
        }
        let annotated_image_path = staged.persist()?;

        tracing::info!(
            "Detected {} objects, annotated image at {:?}",
            detections.len(),
            annotated_image_path
        );

        Ok(DetectionOutcome {
            annotated_image_path,
            tally,
        })
    }
}

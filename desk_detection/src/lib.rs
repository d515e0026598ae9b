mod annotator;
mod detection;
mod error;
mod labels;
mod model_service;
mod ort_service;
mod pipeline;
mod registry;
mod tally;

pub mod app;
pub mod config;

pub use annotator::{annotated_path, Annotator, StagedImage};
pub use app::{build_pipeline, start_app, DetectRequest};
pub use detection::{Detection, DetectionSet};
pub use error::DetectionError;
pub use labels::{ColorLabel, LabelSet};
pub use model_service::ModelService;
pub use ort_service::OrtModelService;
pub use pipeline::{load_image, DetectionOutcome, Pipeline};
pub use registry::{ClassId, ClassRegistry};
pub use tally::{tally, TallyVector};

use crate::registry::ClassId;
use std::{path::PathBuf, time::Duration};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("Failed to decode image {path:?}: {source}")]
    ImageDecode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("Class {0} is not part of the class registry")]
    UnknownClass(ClassId),
    #[error("Class {0} appears more than once in the class registry")]
    DuplicateClass(ClassId),
    #[error("Failed to write {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Detection did not finish within {0:?}")]
    InferenceTimeout(Duration),
    #[error("Confidence threshold {0} is outside [0, 1]")]
    InvalidThreshold(f32),
    #[error("Class {class_id} is outside the model's {num_classes} classes")]
    ClassOutOfRange { class_id: ClassId, num_classes: usize },
    #[error("Inference failed: {0}")]
    Inference(String),
    #[error("Failed to load model: {0}")]
    ModelLoad(#[from] ort::Error),
    #[error("Failed to load labels from {path:?}: {source}")]
    Labels {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Detection was abandoned by its caller")]
    Abandoned,
}

impl DetectionError {
    pub(crate) fn write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DetectionError::Write {
            path: path.into(),
            source,
        }
    }
}

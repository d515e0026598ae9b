use crate::{
    annotator::Annotator,
    config::{Config, Validatable},
    error::DetectionError,
    labels::LabelSet,
    ort_service::OrtModelService,
    pipeline::{DetectionOutcome, Pipeline},
    registry::{ClassId, ClassRegistry},
};
use serde::Serialize;
use std::{path::PathBuf, time::Duration};

/// One detection job from the command line. Unset fields fall back to the
/// configuration.
#[derive(Debug, Clone)]
pub struct DetectRequest {
    pub image_path: PathBuf,
    pub output_dir: Option<PathBuf>,
    pub confidence_threshold: Option<f32>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Serialize)]
struct LabelledCount {
    class_id: ClassId,
    label: String,
    count: u32,
}

#[derive(Debug, Serialize)]
struct Report<'a> {
    #[serde(flatten)]
    outcome: &'a DetectionOutcome,
    labelled_counts: Vec<LabelledCount>,
}

impl<'a> Report<'a> {
    fn new(outcome: &'a DetectionOutcome, labels: &LabelSet) -> Self {
        let labelled_counts = outcome
            .tally
            .iter()
            .map(|(class_id, count)| LabelledCount {
                class_id,
                label: labels.name(class_id),
                count,
            })
            .collect();

        Self {
            outcome,
            labelled_counts,
        }
    }
}

pub fn build_pipeline(
    config: &Config,
    labels: LabelSet,
) -> Result<Pipeline<OrtModelService>, DetectionError> {
    let registry = ClassRegistry::new(config.detection.classes.iter().copied())?;
    let annotator = Annotator::from_config(&config.annotation, labels);
    let model_service = OrtModelService::new(&config.model)?;

    tracing::info!(
        "Pipeline ready with {} whitelisted classes",
        registry.size()
    );

    Ok(Pipeline::new(model_service, registry, annotator))
}

pub async fn start_app(
    config: Config,
    request: DetectRequest,
) -> Result<(), Box<dyn std::error::Error>> {
    let labels = LabelSet::load(&config.labels.get_path())?;
    let pipeline = build_pipeline(&config, labels.clone())?;

    let output_dir = request
        .output_dir
        .unwrap_or_else(|| config.detection.output_dir.clone());
    let confidence_threshold = request
        .confidence_threshold
        .unwrap_or(config.detection.confidence_threshold);
    let timeout = request
        .timeout
        .unwrap_or_else(|| config.detection.get_timeout());

    let outcome = pipeline
        .detect_with_timeout(
            request.image_path,
            output_dir,
            confidence_threshold,
            timeout,
        )
        .await?;

    let report = Report::new(&outcome, &labels);
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}

use crate::registry::ClassId;
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
    pub model: ModelConfig,
    pub labels: LabelsConfig,
    pub detection: DetectionConfig,
    #[serde(default)]
    pub annotation: AnnotationConfig,
}

fn deserialize_log_level<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.try_into().map_err(serde::de::Error::custom)
}

pub trait Validatable {
    fn get_path(&self) -> PathBuf;

    fn validate(&self) -> Result<(), String> {
        if !self.get_path().exists() {
            return Err(format!("File not found: {:?}", self.get_path()));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    pub onnx_file: String,
    pub model_dir: PathBuf,
    #[serde(default = "default_model_instances")]
    pub num_instances: usize,
    #[serde(default = "default_input_size")]
    pub input_size: u32,
    #[serde(default = "default_output_name")]
    pub output_name: String,
    #[serde(default = "default_iou_threshold")]
    pub iou_threshold: f32,
    #[serde(default = "default_max_detections")]
    pub max_detections: usize,
}

fn default_model_instances() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(5)
}

fn default_input_size() -> u32 {
    640
}

fn default_output_name() -> String {
    "output0".to_string()
}

fn default_iou_threshold() -> f32 {
    0.7
}

fn default_max_detections() -> usize {
    300
}

impl Validatable for ModelConfig {
    fn get_path(&self) -> PathBuf {
        self.model_dir.join(&self.onnx_file)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LabelsConfig {
    pub labels_file: String,
    pub labels_dir: PathBuf,
}

impl Validatable for LabelsConfig {
    fn get_path(&self) -> PathBuf {
        self.labels_dir.join(&self.labels_file)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DetectionConfig {
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    #[serde(default = "default_desk_classes")]
    pub classes: Vec<ClassId>,
    pub output_dir: PathBuf,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_confidence_threshold() -> f32 {
    0.25
}

/// COCO ids of the furniture and accessories found on a desk: chair, dining
/// table (desks), tv (monitors), laptop, mouse, keyboard, cell phone, cup,
/// book, clock, potted plant, vase.
fn default_desk_classes() -> Vec<ClassId> {
    [56, 60, 62, 63, 64, 66, 67, 41, 73, 74, 58, 75]
        .into_iter()
        .map(ClassId)
        .collect()
}

fn default_timeout_ms() -> u64 {
    30_000
}

impl DetectionConfig {
    pub fn get_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnnotationConfig {
    #[serde(default)]
    pub font_path: Option<PathBuf>,
    #[serde(default = "default_font_scale")]
    pub font_scale: f32,
    #[serde(default = "default_line_thickness")]
    pub line_thickness: u32,
}

impl Default for AnnotationConfig {
    fn default() -> Self {
        Self {
            font_path: None,
            font_scale: default_font_scale(),
            line_thickness: default_line_thickness(),
        }
    }
}

fn default_font_scale() -> f32 {
    16.0
}

fn default_line_thickness() -> u32 {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum LogLevel {
    Debug,
    Info,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            other => Err(format!(
                "{} is not a supported minimum log level. Use either `debug` or `info`.",
                other
            )),
        }
    }
}

pub fn get_configuration() -> Result<Config, config::ConfigError> {
    let base_path = std::env::current_dir()
        .map_err(|e| config::ConfigError::Message(format!("No current directory: {}", e)))?;
    let configuration_directory = base_path.join("configuration");

    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(config::ConfigError::Message)?;

    let config = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(
            config::File::from(
                configuration_directory.join(format!("{}.yaml", environment.as_str())),
            )
            .required(false),
        )
        .add_source(
            config::Environment::with_prefix("DESK")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    let config = config.try_deserialize::<Config>()?;

    for validation in [config.model.validate(), config.labels.validate()] {
        if let Err(e) = validation {
            tracing::error!("Configuration validation failed: {}", e);
            return Err(config::ConfigError::Message(e));
        }
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
log_level: info
model:
  onnx_file: yolov8s.onnx
  model_dir: models
labels:
  labels_file: coco_labels.txt
  labels_dir: labels
detection:
  output_dir: result
"#;

    fn parse(yaml: &str) -> Result<Config, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()?
            .try_deserialize::<Config>()
    }

    #[test]
    fn test_defaults_are_applied() {
        let config = parse(MINIMAL).unwrap();

        assert_eq!(config.model.input_size, 640);
        assert_eq!(config.model.output_name, "output0");
        assert_eq!(config.model.iou_threshold, 0.7);
        assert_eq!(config.model.max_detections, 300);
        assert!(config.model.num_instances >= 1);
        assert_eq!(config.detection.confidence_threshold, 0.25);
        assert_eq!(config.detection.classes[0], ClassId(56));
        assert_eq!(config.detection.classes[1], ClassId(60));
        assert_eq!(config.detection.classes.len(), 12);
        assert_eq!(config.annotation.line_thickness, 2);
        assert!(config.annotation.font_path.is_none());
        assert_eq!(
            config.model.get_path(),
            PathBuf::from("models").join("yolov8s.onnx")
        );
    }

    #[test]
    fn test_explicit_values_override_defaults() {
        let yaml = format!(
            "{}  confidence_threshold: 0.5\n  classes: [60, 56]\n  timeout_ms: 250\n",
            MINIMAL
        );

        let config = parse(&yaml).unwrap();

        assert_eq!(config.detection.confidence_threshold, 0.5);
        assert_eq!(config.detection.classes, vec![ClassId(60), ClassId(56)]);
        assert_eq!(
            config.detection.get_timeout(),
            std::time::Duration::from_millis(250)
        );
    }

    #[test]
    fn test_unknown_log_level_is_rejected() {
        let yaml = MINIMAL.replace("log_level: info", "log_level: trace");
        assert!(parse(&yaml).is_err());
    }

    #[test]
    fn test_environment_parsing() {
        assert!(matches!(
            Environment::try_from("Production".to_string()),
            Ok(Environment::Production)
        ));
        assert!(Environment::try_from("staging".to_string()).is_err());
    }

    #[test]
    fn test_missing_model_file_fails_validation() {
        let config = parse(MINIMAL).unwrap();
        assert!(config.model.validate().is_err());
    }
}

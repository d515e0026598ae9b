use crate::{error::DetectionError, registry::ClassId};
use std::{
    fs::File,
    io::{self, BufRead},
    path::Path,
};

const FALLBACK_COLOR: [u8; 3] = [255, 0, 255];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColorLabel {
    pub label: String,
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

/// Display names and colours, indexed by class id.
#[derive(Debug, Clone, Default)]
pub struct LabelSet {
    class_labels: Vec<ColorLabel>,
}

impl LabelSet {
    pub fn new(class_labels: Vec<ColorLabel>) -> Self {
        Self { class_labels }
    }

    pub fn load(path: &Path) -> Result<Self, DetectionError> {
        let class_labels = load_yolov8_labels(path).map_err(|source| DetectionError::Labels {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::info!("Loaded {} class labels from {:?}", class_labels.len(), path);
        Ok(Self { class_labels })
    }

    pub fn get(&self, class_id: ClassId) -> Option<&ColorLabel> {
        self.class_labels.get(class_id.as_index())
    }

    pub fn name(&self, class_id: ClassId) -> String {
        match self.get(class_id) {
            Some(color_label) => color_label.label.clone(),
            None => format!("class {}", class_id),
        }
    }

    pub fn color(&self, class_id: ClassId) -> [u8; 3] {
        match self.get(class_id) {
            Some(color_label) => [color_label.red, color_label.green, color_label.blue],
            None => FALLBACK_COLOR,
        }
    }
}

/// Reads `name,red,green,blue` lines; line `n` describes class `n`.
pub fn load_yolov8_labels(filepath: &Path) -> io::Result<Vec<ColorLabel>> {
    let file = File::open(filepath)?;
    parse_labels(io::BufReader::new(file))
}

fn parse_labels(reader: impl BufRead) -> io::Result<Vec<ColorLabel>> {
    let mut color_labels = Vec::new();

    for line_result in reader.lines() {
        let line = line_result?;
        if line.trim().is_empty() {
            continue;
        }
        let parts: Vec<&str> = line.split(',').collect();

        if parts.len() == 4 {
            let label = parts[0].trim().to_string();
            let red = parse_channel(parts[1], "red")?;
            let green = parse_channel(parts[2], "green")?;
            let blue = parse_channel(parts[3], "blue")?;

            color_labels.push(ColorLabel {
                label,
                red,
                green,
                blue,
            });
        } else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Invalid line format: {}", line),
            ));
        }
    }

    Ok(color_labels)
}

fn parse_channel(value: &str, channel: &str) -> io::Result<u8> {
    value.trim().parse().map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Invalid {} value: {}", channel, value.trim()),
        )
    })
}

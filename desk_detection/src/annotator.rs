use crate::{
    config::AnnotationConfig, detection::Detection, error::DetectionError, labels::LabelSet,
};
use ab_glyph::{FontVec, PxScale};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use imageproc::{
    drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size},
    rect::Rect,
};
use std::{
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};
use tempfile::NamedTempFile;

const DEFAULT_EXTENSION: &str = "jpg";
const RESULT_SUFFIX: &str = "_result";
const LABEL_TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const LABEL_PADDING: u32 = 2;
// Rough glyph width relative to the font scale, used when no font is loaded.
const LABEL_CHAR_WIDTH_RATIO: f32 = 0.55;

const SYSTEM_FONTS: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
    "/System/Library/Fonts/Supplemental/Arial.ttf",
    "C:\\Windows\\Fonts\\arial.ttf",
];

// Encoders that accept any Rgb8 canvas. HDR/EXR/farbfeld want other pixel
// types and ICO caps dimensions at 256.
fn encodes_rgb8(format: ImageFormat) -> bool {
    matches!(
        format,
        ImageFormat::Jpeg
            | ImageFormat::Png
            | ImageFormat::Bmp
            | ImageFormat::Tiff
            | ImageFormat::Tga
            | ImageFormat::WebP
            | ImageFormat::Gif
            | ImageFormat::Pnm
            | ImageFormat::Qoi
            | ImageFormat::Avif
    ) && format.writing_enabled()
}

/// `{output_dir}/{stem}_result.{ext}`, keeping the source extension when it
/// names a format that can encode the annotated canvas, `.jpg` otherwise.
pub fn annotated_path(source: &Path, output_dir: &Path) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .filter(|stem| !stem.is_empty())
        .unwrap_or_else(|| "image".to_string());

    let extension = source
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| ImageFormat::from_extension(ext).is_some_and(encodes_rgb8))
        .map(str::to_ascii_lowercase)
        .unwrap_or_else(|| DEFAULT_EXTENSION.to_string());

    output_dir.join(format!("{}{}.{}", stem, RESULT_SUFFIX, extension))
}

fn output_format(destination: &Path) -> ImageFormat {
    ImageFormat::from_path(destination).unwrap_or(ImageFormat::Jpeg)
}

fn load_font(path: &Path) -> Option<FontVec> {
    let data = std::fs::read(path).ok()?;
    FontVec::try_from_vec(data).ok()
}

/// Draws detection boxes and `"{name} {confidence}"` labels.
pub struct Annotator {
    labels: LabelSet,
    font: Option<FontVec>,
    font_scale: f32,
    line_thickness: u32,
}

impl Annotator {
    pub fn new(labels: LabelSet, font: Option<FontVec>, font_scale: f32, line_thickness: u32) -> Self {
        Self {
            labels,
            font,
            font_scale,
            line_thickness: line_thickness.max(1),
        }
    }

    pub fn from_config(config: &AnnotationConfig, labels: LabelSet) -> Self {
        let configured = config.font_path.as_deref().and_then(|path| {
            let font = load_font(path);
            if font.is_none() {
                tracing::warn!("Failed to load font {:?}, trying system fonts", path);
            }
            font
        });

        let font = configured.or_else(|| {
            SYSTEM_FONTS.iter().find_map(|path| {
                let font = load_font(Path::new(path))?;
                tracing::info!("Loaded system font: {}", path);
                Some(font)
            })
        });

        if font.is_none() {
            tracing::warn!("No font available, labels will be drawn without text");
        }

        Self::new(labels, font, config.font_scale, config.line_thickness)
    }

    pub fn label_for(&self, detection: &Detection) -> String {
        format!(
            "{} {:.2}",
            self.labels.name(detection.class_id),
            detection.confidence
        )
    }

    /// Copies `image` and draws each detection on the copy once.
    pub fn render(&self, image: &DynamicImage, detections: &[Detection]) -> RgbImage {
        let mut canvas = image.to_rgb8();
        for detection in detections {
            self.draw_detection(&mut canvas, detection);
        }
        canvas
    }

    fn draw_detection(&self, canvas: &mut RgbImage, detection: &Detection) {
        let (width, height) = canvas.dimensions();
        if width == 0 || height == 0 {
            return;
        }
        let (max_x, max_y) = (width as i32 - 1, height as i32 - 1);
        let color = Rgb(self.labels.color(detection.class_id));

        let x1 = (detection.x1.floor() as i32).clamp(0, max_x);
        let y1 = (detection.y1.floor() as i32).clamp(0, max_y);
        let x2 = (detection.x2.ceil() as i32).clamp(x1, max_x);
        let y2 = (detection.y2.ceil() as i32).clamp(y1, max_y);

        for t in 0..self.line_thickness as i32 {
            let w = x2 - x1 - 2 * t + 1;
            let h = y2 - y1 - 2 * t + 1;
            if w <= 0 || h <= 0 {
                break;
            }
            let rect = Rect::at(x1 + t, y1 + t).of_size(w as u32, h as u32);
            draw_hollow_rect_mut(canvas, rect, color);
        }

        let label = self.label_for(detection);
        self.draw_label(canvas, x1, y1, &label, color);
    }

    fn draw_label(&self, canvas: &mut RgbImage, x: i32, y: i32, label: &str, color: Rgb<u8>) {
        let scale = PxScale::from(self.font_scale);
        let (text_width, text_height) = match &self.font {
            Some(font) => text_size(scale, font, label),
            None => (
                (label.chars().count() as f32 * self.font_scale * LABEL_CHAR_WIDTH_RATIO) as u32,
                self.font_scale.ceil() as u32,
            ),
        };

        let label_height = text_height + 2 * LABEL_PADDING;
        let label_y = (y - label_height as i32).max(0);
        let max_width = (canvas.width() as i32 - x).max(0) as u32;
        let label_width = (text_width + 2 * LABEL_PADDING).min(max_width);

        if label_width == 0 || label_height == 0 {
            return;
        }

        let rect = Rect::at(x, label_y).of_size(label_width, label_height);
        draw_filled_rect_mut(canvas, rect, color);

        if let Some(font) = &self.font {
            draw_text_mut(
                canvas,
                LABEL_TEXT_COLOR,
                x + LABEL_PADDING as i32,
                label_y + LABEL_PADDING as i32,
                scale,
                font,
                label,
            );
        }
    }

    /// Encodes `image` into a temporary file next to `destination`. Nothing is
    /// visible at `destination` until [`StagedImage::persist`].
    pub fn stage(
        &self,
        image: &RgbImage,
        destination: PathBuf,
    ) -> Result<StagedImage, DetectionError> {
        let dir = destination
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let mut file = tempfile::Builder::new()
            .prefix(".")
            .suffix(".partial")
            .tempfile_in(&dir)
            .map_err(|e| DetectionError::write(&dir, e))?;

        {
            let mut writer = BufWriter::new(file.as_file_mut());
            image
                .write_to(&mut writer, output_format(&destination))
                .map_err(|e| DetectionError::write(&destination, std::io::Error::other(e)))?;
            writer
                .flush()
                .map_err(|e| DetectionError::write(&destination, e))?;
        }

        Ok(StagedImage { file, destination })
    }
}

/// An encoded annotated image waiting to be moved into place. Dropping it
/// removes the temporary file.
pub struct StagedImage {
    file: NamedTempFile,
    destination: PathBuf,
}

impl StagedImage {
    pub fn persist(self) -> Result<PathBuf, DetectionError> {
        let StagedImage { file, destination } = self;
        file.persist(&destination)
            .map_err(|e| DetectionError::write(&destination, e.error))?;
        tracing::debug!("Wrote annotated image to {:?}", destination);
        Ok(destination)
    }
}

use crate::{
    config::{ModelConfig, Validatable},
    detection::{Detection, DetectionSet},
    error::DetectionError,
    model_service::ModelService,
    registry::ClassId,
};
use image::{imageops::FilterType, DynamicImage, GenericImageView};
use ndarray::{Array, ArrayView2, Axis, Ix3, Ix4};
#[cfg(feature = "tensorrt")]
use ort::execution_providers::TensorRTExecutionProvider;
use ort::{
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

/// Box coordinates and class scores occupy the first rows of a YOLOv8 output.
const BOX_FEATURES: usize = 4;

fn transform_image(image: &DynamicImage, input_size: u32) -> Array<f32, Ix4> {
    let size = input_size as usize;
    let img = image.resize_exact(input_size, input_size, FilterType::CatmullRom);

    let mut input = Array::zeros((1, 3, size, size));
    for pixel in img.pixels() {
        let x = pixel.0 as usize;
        let y = pixel.1 as usize;
        let [r, g, b, _] = pixel.2 .0;
        input[[0, 0, y, x]] = (r as f32) / 255.;
        input[[0, 1, y, x]] = (g as f32) / 255.;
        input[[0, 2, y, x]] = (b as f32) / 255.;
    }

    input
}

#[derive(Debug, Clone, Copy)]
struct DecodeParams<'a> {
    whitelist: &'a [ClassId],
    confidence_threshold: f32,
    iou_threshold: f32,
    max_detections: usize,
    scale_x: f32,
    scale_y: f32,
}

/// Turns a `[4 + classes, anchors]` prediction matrix into detections.
///
/// Each anchor is assigned its best *whitelisted* class, so non-whitelisted
/// scores never compete. Anchors under the threshold are dropped before NMS.
fn decode_predictions(
    predictions: ArrayView2<f32>,
    params: &DecodeParams,
) -> Result<DetectionSet, DetectionError> {
    let features = predictions.nrows();
    if features <= BOX_FEATURES {
        return Err(DetectionError::Inference(format!(
            "expected more than {} output features, got {}",
            BOX_FEATURES, features
        )));
    }

    let num_classes = features - BOX_FEATURES;
    if let Some(&class_id) = params
        .whitelist
        .iter()
        .find(|class_id| class_id.as_index() >= num_classes)
    {
        return Err(DetectionError::ClassOutOfRange {
            class_id,
            num_classes,
        });
    }

    let mut candidates = Vec::new();
    for anchor in predictions.axis_iter(Axis(1)) {
        let best = params
            .whitelist
            .iter()
            .map(|&class_id| (class_id, anchor[BOX_FEATURES + class_id.as_index()]))
            .reduce(|accum, item| if item.1 > accum.1 { item } else { accum });

        let Some((class_id, confidence)) = best else {
            continue;
        };
        if confidence <= 0. || confidence < params.confidence_threshold {
            continue;
        }

        let xc = anchor[0] * params.scale_x;
        let yc = anchor[1] * params.scale_y;
        let w = anchor[2] * params.scale_x;
        let h = anchor[3] * params.scale_y;

        candidates.push(Detection {
            class_id,
            confidence,
            x1: xc - w / 2.,
            y1: yc - h / 2.,
            x2: xc + w / 2.,
            y2: yc + h / 2.,
        });
    }

    Ok(non_max_suppression(
        candidates,
        params.iou_threshold,
        params.max_detections,
    ))
}

/// Greedy per-class suppression, highest confidence first.
fn non_max_suppression(
    mut candidates: Vec<Detection>,
    iou_threshold: f32,
    max_detections: usize,
) -> DetectionSet {
    candidates.sort_by(|box1, box2| box2.confidence.total_cmp(&box1.confidence));

    let mut result: DetectionSet = Vec::new();
    for candidate in candidates {
        if result.len() >= max_detections {
            break;
        }
        let suppressed = result.iter().any(|kept| {
            kept.class_id == candidate.class_id && kept.iou(&candidate) >= iou_threshold
        });
        if !suppressed {
            result.push(candidate);
        }
    }

    result
}

/// Pool of ONNX Runtime sessions over one YOLOv8 checkpoint, loaded once and
/// shared. Each session is used by one call at a time.
#[derive(Clone)]
pub struct OrtModelService {
    sessions: Arc<Vec<Arc<Mutex<Session>>>>,
    counter: Arc<AtomicUsize>,
    input_size: u32,
    output_name: String,
    iou_threshold: f32,
    max_detections: usize,
}

impl OrtModelService {
    pub fn new(model_config: &ModelConfig) -> Result<Self, DetectionError> {
        #[cfg(feature = "tensorrt")]
        ort::init()
            .with_execution_providers([TensorRTExecutionProvider::default()
                .with_engine_cache(true)
                .build()])
            .commit()?;

        let num_instances = model_config.num_instances.max(1);
        let sessions = (0..num_instances)
            .map(|_| {
                let session = Session::builder()?
                    .with_optimization_level(GraphOptimizationLevel::Level3)?
                    .commit_from_file(model_config.get_path())?;
                Ok(Arc::new(Mutex::new(session)))
            })
            .collect::<Result<Vec<_>, ort::Error>>()?;

        tracing::info!(
            "Created {} ONNX sessions from {:?}",
            num_instances,
            model_config.get_path()
        );

        Ok(Self {
            sessions: Arc::new(sessions),
            counter: Arc::new(AtomicUsize::new(0)),
            input_size: model_config.input_size,
            output_name: model_config.output_name.clone(),
            iou_threshold: model_config.iou_threshold,
            max_detections: model_config.max_detections,
        })
    }

    fn run_inference(&self, input: &Array<f32, Ix4>) -> Result<ndarray::ArrayD<f32>, DetectionError> {
        let index = self.counter.fetch_add(1, Ordering::SeqCst) % self.sessions.len();
        let session_arc = &self.sessions[index];
        let mut session = session_arc
            .lock()
            .map_err(|e| DetectionError::Inference(format!("session mutex poisoned: {}", e)))?;

        tracing::debug!("Handling request with session {}", index);
        let owned_buffer;
        let input_view = if input.view().is_standard_layout() {
            input.view()
        } else {
            owned_buffer = input.as_standard_layout().into_owned();
            owned_buffer.view()
        };

        let tensor_ref = TensorRef::from_array_view(input_view)
            .map_err(|e| DetectionError::Inference(format!("failed to build tensor: {}", e)))?;

        let outputs = session
            .run(ort::inputs![tensor_ref])
            .map_err(|e| DetectionError::Inference(format!("inference failed: {}", e)))?;

        let (shape, data) = outputs[self.output_name.as_str()]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectionError::Inference(format!("failed to extract tensor: {}", e)))?;

        let ix = shape.to_ixdyn();
        let array = ndarray::ArrayD::from_shape_vec(ix, data.to_vec())
            .map_err(|e| DetectionError::Inference(format!("invalid tensor shape: {}", e)))?;

        Ok(array)
    }
}

impl ModelService for OrtModelService {
    #[tracing::instrument(skip(self, image, whitelist), fields(width = image.width(), height = image.height()))]
    fn infer(
        &self,
        image: &DynamicImage,
        confidence_threshold: f32,
        whitelist: &[ClassId],
    ) -> Result<DetectionSet, DetectionError> {
        let (img_width, img_height) = image.dimensions();
        let input = transform_image(image, self.input_size);

        let outputs = self
            .run_inference(&input)?
            .into_dimensionality::<Ix3>()
            .map_err(|e| DetectionError::Inference(format!("unexpected output rank: {}", e)))?;
        if outputs.len_of(Axis(0)) == 0 {
            return Err(DetectionError::Inference("empty output batch".to_string()));
        }

        let params = DecodeParams {
            whitelist,
            confidence_threshold,
            iou_threshold: self.iou_threshold,
            max_detections: self.max_detections,
            scale_x: img_width as f32 / self.input_size as f32,
            scale_y: img_height as f32 / self.input_size as f32,
        };
        let detections = decode_predictions(outputs.index_axis(Axis(0), 0), &params)?;

        tracing::debug!("Returning {} detections", detections.len());
        for (i, detection) in detections.iter().enumerate() {
            tracing::debug!(
                "Detection {}: class_id={}, confidence={:.3}, bbox=({:.1}, {:.1}, {:.1}, {:.1})",
                i,
                detection.class_id,
                detection.confidence,
                detection.x1,
                detection.y1,
                detection.x2,
                detection.y2
            );
        }

        Ok(detections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};
    use ndarray::Array2;

    const NUM_CLASSES: usize = 80;

    struct Anchor<'a> {
        bbox: [f32; 4],
        scores: &'a [(usize, f32)],
    }

    fn predictions(anchors: &[Anchor]) -> Array2<f32> {
        let mut output = Array2::zeros((BOX_FEATURES + NUM_CLASSES, anchors.len()));
        for (column, anchor) in anchors.iter().enumerate() {
            for (row, value) in anchor.bbox.iter().enumerate() {
                output[[row, column]] = *value;
            }
            for &(class, score) in anchor.scores {
                output[[BOX_FEATURES + class, column]] = score;
            }
        }
        output
    }

    fn params(whitelist: &[ClassId], confidence_threshold: f32) -> DecodeParams<'_> {
        DecodeParams {
            whitelist,
            confidence_threshold,
            iou_threshold: 0.7,
            max_detections: 300,
            scale_x: 1.,
            scale_y: 1.,
        }
    }

    fn desk_whitelist() -> Vec<ClassId> {
        vec![ClassId(56), ClassId(60)]
    }

    #[test]
    fn test_transform_image() {
        let img = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_pixel(100, 50, Rgb([255, 0, 0]));
        let image = DynamicImage::ImageRgb8(img);

        let input = transform_image(&image, 640);

        assert_eq!(input.shape(), &[1, 3, 640, 640]);
        assert!((input[[0, 0, 10, 10]] - 1.).abs() < 1e-6);
        assert!(input[[0, 1, 10, 10]].abs() < 1e-6);
        assert!(input[[0, 2, 10, 10]].abs() < 1e-6);
    }

    #[test]
    fn test_decode_converts_centre_size_to_corners() {
        let output = predictions(&[Anchor {
            bbox: [100., 50., 40., 20.],
            scores: &[(56, 0.9)],
        }]);
        let whitelist = desk_whitelist();
        let mut params = params(&whitelist, 0.25);
        params.scale_x = 2.;
        params.scale_y = 0.5;

        let detections = decode_predictions(output.view(), &params).unwrap();

        assert_eq!(detections.len(), 1);
        let detection = detections[0];
        assert_eq!(detection.class_id, ClassId(56));
        assert_eq!(detection.confidence, 0.9);
        assert_eq!(
            (detection.x1, detection.y1, detection.x2, detection.y2),
            (160., 20., 240., 30.)
        );
    }

    #[test]
    fn test_whitelist_picks_best_allowed_class() {
        // Person (0) dominates the anchor but only chair/desk are allowed.
        let output = predictions(&[Anchor {
            bbox: [10., 10., 4., 4.],
            scores: &[(0, 0.95), (56, 0.4), (60, 0.6)],
        }]);
        let whitelist = desk_whitelist();

        let detections = decode_predictions(output.view(), &params(&whitelist, 0.25)).unwrap();

        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].class_id, ClassId(60));
        assert_eq!(detections[0].confidence, 0.6);
    }

    #[test]
    fn test_non_whitelisted_anchors_are_not_reported() {
        let output = predictions(&[Anchor {
            bbox: [10., 10., 4., 4.],
            scores: &[(0, 0.95)],
        }]);
        let whitelist = desk_whitelist();

        let detections = decode_predictions(output.view(), &params(&whitelist, 0.25)).unwrap();

        assert!(detections.is_empty());
    }

    #[test]
    fn test_threshold_drops_weak_candidates() {
        let output = predictions(&[
            Anchor {
                bbox: [10., 10., 4., 4.],
                scores: &[(56, 0.3)],
            },
            Anchor {
                bbox: [100., 100., 4., 4.],
                scores: &[(60, 0.8)],
            },
        ]);
        let whitelist = desk_whitelist();

        let detections = decode_predictions(output.view(), &params(&whitelist, 0.5)).unwrap();

        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].class_id, ClassId(60));
    }

    #[test]
    fn test_nms_suppresses_same_class_overlap_only() {
        let output = predictions(&[
            Anchor {
                bbox: [50., 50., 20., 20.],
                scores: &[(56, 0.9)],
            },
            Anchor {
                bbox: [51., 50., 20., 20.],
                scores: &[(56, 0.8)],
            },
            Anchor {
                bbox: [50., 51., 20., 20.],
                scores: &[(60, 0.7)],
            },
        ]);
        let whitelist = desk_whitelist();

        let detections = decode_predictions(output.view(), &params(&whitelist, 0.25)).unwrap();

        assert_eq!(detections.len(), 2);
        assert_eq!(detections[0].class_id, ClassId(56));
        assert_eq!(detections[0].confidence, 0.9);
        assert_eq!(detections[1].class_id, ClassId(60));
    }

    #[test]
    fn test_max_detections_keeps_most_confident() {
        let output = predictions(&[
            Anchor {
                bbox: [10., 10., 4., 4.],
                scores: &[(56, 0.5)],
            },
            Anchor {
                bbox: [100., 10., 4., 4.],
                scores: &[(56, 0.9)],
            },
            Anchor {
                bbox: [200., 10., 4., 4.],
                scores: &[(56, 0.7)],
            },
        ]);
        let whitelist = desk_whitelist();
        let mut params = params(&whitelist, 0.25);
        params.max_detections = 2;

        let detections = decode_predictions(output.view(), &params).unwrap();

        let confidences: Vec<f32> = detections.iter().map(|d| d.confidence).collect();
        assert_eq!(confidences, vec![0.9, 0.7]);
    }

    #[test]
    fn test_raising_threshold_never_adds_detections() {
        let output = predictions(&[
            Anchor {
                bbox: [50., 50., 20., 20.],
                scores: &[(56, 0.45)],
            },
            Anchor {
                bbox: [52., 50., 20., 20.],
                scores: &[(56, 0.65)],
            },
            Anchor {
                bbox: [300., 300., 30., 30.],
                scores: &[(60, 0.55)],
            },
            Anchor {
                bbox: [120., 40., 10., 10.],
                scores: &[(56, 0.3), (60, 0.35)],
            },
            Anchor {
                bbox: [400., 80., 10., 10.],
                scores: &[(60, 0.95)],
            },
        ]);
        let whitelist = desk_whitelist();

        let mut previous = usize::MAX;
        for step in 0..=20 {
            let threshold = step as f32 / 20.;
            let count = decode_predictions(output.view(), &params(&whitelist, threshold))
                .unwrap()
                .len();
            assert!(count <= previous, "threshold {} produced more detections", threshold);
            previous = count;
        }
        assert_eq!(previous, 0);
    }

    #[test]
    fn test_whitelist_outside_model_classes_fails() {
        let output = predictions(&[]);
        let whitelist = vec![ClassId(56), ClassId(90)];

        let result = decode_predictions(output.view(), &params(&whitelist, 0.25));

        assert!(matches!(
            result,
            Err(DetectionError::ClassOutOfRange {
                class_id: ClassId(90),
                num_classes: NUM_CLASSES
            })
        ));
    }

    #[test]
    fn test_output_without_class_scores_fails() {
        let output = Array2::<f32>::zeros((4, 10));
        let whitelist = desk_whitelist();

        let result = decode_predictions(output.view(), &params(&whitelist, 0.25));

        assert!(matches!(result, Err(DetectionError::Inference(_))));
    }
}

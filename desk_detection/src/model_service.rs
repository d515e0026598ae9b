use crate::{detection::DetectionSet, error::DetectionError, registry::ClassId};
use image::DynamicImage;

/// A loaded detector. Candidates scoring below `confidence_threshold` and
/// classes outside `whitelist` never reach the returned set.
pub trait ModelService: Send + Sync + 'static {
    fn infer(
        &self,
        image: &DynamicImage,
        confidence_threshold: f32,
        whitelist: &[ClassId],
    ) -> Result<DetectionSet, DetectionError>;
}

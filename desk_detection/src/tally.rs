use crate::{
    detection::Detection,
    error::DetectionError,
    registry::{ClassId, ClassRegistry},
};
use serde::Serialize;
use std::sync::Arc;

/// Per-class occurrence counts, laid out in the order of the registry they
/// were built against. The registry travels with the counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TallyVector {
    #[serde(rename = "classes")]
    registry: Arc<ClassRegistry>,
    counts: Vec<u32>,
}

impl TallyVector {
    pub fn registry(&self) -> &ClassRegistry {
        &self.registry
    }

    pub fn counts(&self) -> &[u32] {
        &self.counts
    }

    pub fn total(&self) -> u32 {
        self.counts.iter().sum()
    }

    pub fn count_of(&self, class_id: ClassId) -> Result<u32, DetectionError> {
        let index = self.registry.index_of(class_id)?;
        Ok(self.counts[index])
    }

    /// `(class, count)` pairs in registry order.
    pub fn iter(&self) -> impl Iterator<Item = (ClassId, u32)> + '_ {
        self.registry
            .class_ids()
            .iter()
            .copied()
            .zip(self.counts.iter().copied())
    }
}

pub fn tally(
    detections: &[Detection],
    registry: &Arc<ClassRegistry>,
) -> Result<TallyVector, DetectionError> {
    let mut counts = vec![0u32; registry.size()];
    for detection in detections {
        let index = registry.index_of(detection.class_id)?;
        counts[index] += 1;
    }

    Ok(TallyVector {
        registry: registry.clone(),
        counts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(class_id: u32) -> Detection {
        Detection {
            class_id: ClassId(class_id),
            confidence: 0.8,
            x1: 0.,
            y1: 0.,
            x2: 10.,
            y2: 10.,
        }
    }

    fn desk_registry() -> Arc<ClassRegistry> {
        Arc::new(ClassRegistry::new([56u32, 60]).unwrap())
    }

    #[test]
    fn test_chairs_and_desk() {
        let registry = desk_registry();
        let detections = vec![detection(56), detection(60), detection(56)];

        let tally = tally(&detections, &registry).unwrap();

        assert_eq!(tally.counts(), &[2, 1]);
        assert_eq!(tally.count_of(ClassId(56)).unwrap(), 2);
        assert_eq!(tally.count_of(ClassId(60)).unwrap(), 1);
        assert_eq!(
            tally.iter().collect::<Vec<_>>(),
            vec![(ClassId(56), 2), (ClassId(60), 1)]
        );
    }

    #[test]
    fn test_no_detections_gives_all_zero() {
        let registry = desk_registry();

        let tally = tally(&[], &registry).unwrap();

        assert_eq!(tally.counts(), &[0, 0]);
        assert_eq!(tally.total(), 0);
    }

    #[test]
    fn test_total_matches_detection_count() {
        let registry = Arc::new(ClassRegistry::new([56u32, 60, 62, 63, 64, 66]).unwrap());
        let detections: Vec<_> = [63, 64, 66, 66, 62, 56, 63, 60, 64]
            .into_iter()
            .map(detection)
            .collect();

        let tally = tally(&detections, &registry).unwrap();

        assert_eq!(tally.counts().len(), registry.size());
        assert_eq!(tally.total() as usize, detections.len());
    }

    #[test]
    fn test_unregistered_class_fails() {
        let registry = desk_registry();
        let detections = vec![detection(56), detection(0)];

        let result = tally(&detections, &registry);

        assert!(matches!(
            result,
            Err(DetectionError::UnknownClass(ClassId(0)))
        ));
    }

    #[test]
    fn test_serializes_with_class_order() {
        let registry = desk_registry();
        let tally = tally(&[detection(60)], &registry).unwrap();

        let json = serde_json::to_value(&tally).unwrap();

        assert_eq!(json, serde_json::json!({"classes": [56, 60], "counts": [0, 1]}));
    }
}

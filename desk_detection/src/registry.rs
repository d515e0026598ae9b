use crate::error::DetectionError;
use serde::{ser::SerializeSeq, Deserialize, Serialize, Serializer};
use std::{collections::HashMap, fmt};

/// Category identifier from the detector's training taxonomy (COCO for YOLOv8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClassId(pub u32);

impl ClassId {
    pub fn as_index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for ClassId {
    fn from(id: u32) -> Self {
        ClassId(id)
    }
}

/// Ordered whitelist of classes. The order is the layout of every tally vector
/// built against this registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassRegistry {
    classes: Vec<ClassId>,
    positions: HashMap<ClassId, usize>,
}

impl ClassRegistry {
    pub fn new<I>(classes: I) -> Result<Self, DetectionError>
    where
        I: IntoIterator,
        I::Item: Into<ClassId>,
    {
        let mut ordered = Vec::new();
        let mut positions = HashMap::new();

        for class_id in classes.into_iter().map(Into::into) {
            if positions.insert(class_id, ordered.len()).is_some() {
                return Err(DetectionError::DuplicateClass(class_id));
            }
            ordered.push(class_id);
        }

        Ok(Self {
            classes: ordered,
            positions,
        })
    }

    pub fn index_of(&self, class_id: ClassId) -> Result<usize, DetectionError> {
        self.positions
            .get(&class_id)
            .copied()
            .ok_or(DetectionError::UnknownClass(class_id))
    }

    pub fn size(&self) -> usize {
        self.classes.len()
    }

    /// The whitelist handed to the model, in registry order.
    pub fn class_ids(&self) -> &[ClassId] {
        &self.classes
    }
}

impl Serialize for ClassRegistry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.classes.len()))?;
        for class_id in &self.classes {
            seq.serialize_element(class_id)?;
        }
        seq.end()
    }
}

use std::sync::OnceLock;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::geometry::BBox;
use crate::TrackId;

/// One tracked object reported by the external detector for a single frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Pixel-space box.
    pub bbox: BBox,
    pub class: ObjectClass,
    /// Raw label as emitted by the model.
    pub label: String,
    pub confidence: f32,
    /// Persistent identity while the tracker holds the object. `None` when
    /// tracking was lost; such detections are drawn but never alerted on.
    pub track_id: Option<TrackId>,
}

impl Detection {
    pub fn new(bbox: BBox, class: ObjectClass, confidence: f32, track_id: Option<TrackId>) -> Self {
        Self {
            bbox,
            label: class.as_str().to_string(),
            class,
            confidence,
            track_id,
        }
    }

    /// Ingestion-boundary check. Rules assume every detection passed this.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(anyhow!(
                "detection confidence {} outside [0, 1]",
                self.confidence
            ));
        }
        if !self.bbox.is_valid() {
            return Err(anyhow!("detection box {:?} is not a valid box", self.bbox));
        }
        Ok(())
    }
}

#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectClass {
    Person,
    Head,
    Helmet,
    Other,
}

impl ObjectClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectClass::Person => "person",
            ObjectClass::Head => "head",
            ObjectClass::Helmet => "helmet",
            ObjectClass::Other => "other",
        }
    }
}

/// Maps model labels onto the roles the rules understand.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassMap {
    pub person: Vec<String>,
    pub head: Vec<String>,
    pub helmet: Vec<String>,
}

impl Default for ClassMap {
    fn default() -> Self {
        Self {
            person: vec!["person".to_string()],
            head: vec!["head".to_string()],
            helmet: vec!["helmet".to_string(), "hardhat".to_string()],
        }
    }
}

impl ClassMap {
    pub fn classify(&self, label: &str) -> ObjectClass {
        let label = label.trim().to_lowercase();
        if self.person.iter().any(|l| *l == label) {
            ObjectClass::Person
        } else if self.helmet.iter().any(|l| *l == label) {
            ObjectClass::Helmet
        } else if self.head.iter().any(|l| *l == label) {
            ObjectClass::Head
        } else {
            ObjectClass::Other
        }
    }

    /// Lowercases every label and checks it against `^[a-z0-9_-]{1,32}$`.
    pub fn normalized(&self) -> Result<Self> {
        let normalize = |labels: &[String]| -> Result<Vec<String>> {
            labels
                .iter()
                .map(|label| {
                    let label = label.trim().to_lowercase();
                    validate_label(&label)?;
                    Ok(label)
                })
                .collect()
        };
        let map = Self {
            person: normalize(&self.person)?,
            head: normalize(&self.head)?,
            helmet: normalize(&self.helmet)?,
        };
        if map.person.is_empty() {
            return Err(anyhow!("class map must name at least one person label"));
        }
        for label in &map.person {
            if map.head.contains(label) || map.helmet.contains(label) {
                return Err(anyhow!("label '{}' mapped to more than one class", label));
            }
        }
        if let Some(label) = map.head.iter().find(|l| map.helmet.contains(l)) {
            return Err(anyhow!("label '{}' mapped to more than one class", label));
        }
        Ok(map)
    }
}

pub fn validate_label(label: &str) -> Result<()> {
    static LABEL_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = LABEL_RE.get_or_init(|| regex::Regex::new(r"^[a-z0-9_-]{1,32}$").unwrap());
    if !re.is_match(label) {
        return Err(anyhow!(
            "class label '{}' must match ^[a-z0-9_-]{{1,32}}$",
            label
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_uses_configured_labels() {
        let map = ClassMap::default();
        assert_eq!(map.classify("person"), ObjectClass::Person);
        assert_eq!(map.classify("HardHat"), ObjectClass::Helmet);
        assert_eq!(map.classify("head"), ObjectClass::Head);
        assert_eq!(map.classify("forklift"), ObjectClass::Other);
    }

    #[test]
    fn normalized_rejects_bad_or_ambiguous_labels() {
        let mut map = ClassMap::default();
        map.helmet.push("hard hat".to_string());
        assert!(map.normalized().is_err());

        let mut map = ClassMap::default();
        map.head.push("helmet".to_string());
        assert!(map.normalized().is_err());

        let map = ClassMap {
            person: vec!["Worker".to_string()],
            ..ClassMap::default()
        };
        assert_eq!(map.normalized().unwrap().person, vec!["worker"]);
    }

    #[test]
    fn validate_detection_ranges() {
        let ok = Detection::new(BBox::new(0.0, 0.0, 10.0, 20.0), ObjectClass::Person, 0.9, Some(1));
        assert!(ok.validate().is_ok());

        let mut bad = ok.clone();
        bad.confidence = 1.2;
        assert!(bad.validate().is_err());

        let mut bad = ok;
        bad.bbox.w = -1.0;
        assert!(bad.validate().is_err());
    }
}

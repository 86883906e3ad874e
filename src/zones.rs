//! Zone configuration loading.
//!
//! Zones are read once at startup from JSON. Two shapes are accepted:
//!
//! ```text
//! [{"camera_id": 0, "zones": [{"name": "pit", "points": [[x, y], ...]}]}]
//! {"0": [[x, y], ...], "1": [[x, y], ...]}
//! ```
//!
//! The second is the map written by the zone-drawing tool (one zone per
//! camera). Every polygon is validated here, so rules never see a degenerate
//! zone.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use serde::Deserialize;

use crate::error::PipelineError;
use crate::geometry::{Point, Polygon};
use crate::CameraId;

/// Restricted polygonal region on one camera's image plane.
#[derive(Clone, Debug, PartialEq)]
pub struct Zone {
    pub camera_id: CameraId,
    pub name: String,
    pub polygon: Polygon,
}

impl Zone {
    pub fn new(camera_id: CameraId, name: impl Into<String>, points: &[[f32; 2]]) -> Result<Self> {
        Ok(Self {
            camera_id,
            name: name.into(),
            polygon: Polygon::from_pairs(points)?,
        })
    }

    pub fn contains(&self, point: Point) -> bool {
        crate::geometry::contains(&self.polygon, point)
    }
}

/// Zones grouped by camera.
#[derive(Clone, Debug, Default)]
pub struct ZoneMap {
    zones: BTreeMap<CameraId, Vec<Zone>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ZoneFile {
    Cameras(Vec<CameraZonesFile>),
    Legacy(BTreeMap<String, Vec<[f32; 2]>>),
}

#[derive(Debug, Deserialize)]
struct CameraZonesFile {
    camera_id: CameraId,
    #[serde(default)]
    zones: Vec<ZoneEntryFile>,
}

#[derive(Debug, Deserialize)]
struct ZoneEntryFile {
    name: Option<String>,
    points: Vec<[f32; 2]>,
}

impl ZoneMap {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::config(format!(
                "failed to read zone file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_json(&raw).map_err(|e| {
            PipelineError::config(format!("invalid zone file {}: {:#}", path.display(), e))
        })
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let file: ZoneFile = serde_json::from_str(raw)
            .map_err(|e| PipelineError::config(format!("zone json: {}", e)))?;
        let mut map = ZoneMap::default();
        match file {
            ZoneFile::Cameras(cameras) => {
                for camera in cameras {
                    for (idx, entry) in camera.zones.into_iter().enumerate() {
                        let name = entry
                            .name
                            .unwrap_or_else(|| format!("zone{}", idx));
                        map.insert(zone_or_config_error(camera.camera_id, name, &entry.points)?);
                    }
                }
            }
            ZoneFile::Legacy(entries) => {
                for (key, points) in entries {
                    let camera_id: CameraId = key.trim().parse().map_err(|_| {
                        PipelineError::config(format!("zone key '{}' is not a camera id", key))
                    })?;
                    map.insert(zone_or_config_error(camera_id, "zone0".to_string(), &points)?);
                }
            }
        }
        Ok(map)
    }

    pub fn insert(&mut self, zone: Zone) {
        self.zones.entry(zone.camera_id).or_default().push(zone);
    }

    pub fn for_camera(&self, camera_id: CameraId) -> &[Zone] {
        self.zones
            .get(&camera_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn camera_ids(&self) -> impl Iterator<Item = CameraId> + '_ {
        self.zones.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.zones.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn zone_or_config_error(camera_id: CameraId, name: String, points: &[[f32; 2]]) -> Result<Zone> {
    Zone::new(camera_id, name.clone(), points).map_err(|e| {
        PipelineError::config(format!("camera {} zone '{}': {:#}", camera_id, name, e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn loads_canonical_shape() {
        let map = ZoneMap::from_json(
            r#"[
                {"camera_id": 0, "zones": [
                    {"name": "pit", "points": [[0, 0], [0, 10], [10, 10], [10, 0]]},
                    {"points": [[20, 20], [30, 20], [25, 30]]}
                ]},
                {"camera_id": 2, "zones": []}
            ]"#,
        )
        .unwrap();
        assert_eq!(map.len(), 2);
        let zones = map.for_camera(0);
        assert_eq!(zones[0].name, "pit");
        assert_eq!(zones[1].name, "zone1");
        assert!(zones[0].contains(Point::new(5.0, 5.0)));
        assert!(map.for_camera(2).is_empty());
        assert!(map.for_camera(9).is_empty());
    }

    #[test]
    fn loads_legacy_tool_shape() {
        let map = ZoneMap::from_json(r#"{"1": [[100, 100], [200, 100], [200, 300], [100, 300]]}"#)
            .unwrap();
        assert_eq!(map.camera_ids().collect::<Vec<_>>(), vec![1]);
        assert!(map.for_camera(1)[0].contains(Point::new(150.0, 150.0)));
    }

    #[test]
    fn rejects_short_polygons_as_configuration_errors() {
        let json = r#"[{"camera_id": 0, "zones": [{"points": [[0, 0], [1, 1]]}]}]"#;
        let err = ZoneMap::from_json(json).unwrap_err();
        assert_eq!(ErrorKind::classify(&err), ErrorKind::ConfigurationError);
        assert!(format!("{:#}", err).contains("camera 0"));

        let err = ZoneMap::from_json(r#"{"front": [[0, 0], [1, 1], [2, 0]]}"#).unwrap_err();
        assert_eq!(ErrorKind::classify(&err), ErrorKind::ConfigurationError);
    }
}

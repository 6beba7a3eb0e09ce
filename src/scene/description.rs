//! Top-level scene description file

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::error::TileError;
use crate::core::types::{DVec3, Mat4, Result};
use crate::math::Aabb;

/// One tile tree of a scene
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RootEntry {
    pub name: String,
    /// Tile file holding the root level, relative to the scene file
    pub file: String,
    pub bounds: Aabb,
}

/// Parsed scene file (JSON)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SceneDescription {
    pub name: String,
    /// EPSG code or WKT string, passed through untouched
    #[serde(default)]
    pub coordinate_system: Option<String>,
    #[serde(default)]
    pub origin: [f64; 3],
    /// Column-major model transform applied below the origin offset
    #[serde(default)]
    pub transform: Option<[f32; 16]>,
    pub roots: Vec<RootEntry>,
}

impl SceneDescription {
    pub fn parse(json: &str) -> Result<Self> {
        let description: SceneDescription =
            serde_json::from_str(json).map_err(|e| TileError::Parse(e.to_string()))?;
        description.validate()?;
        Ok(description)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => TileError::NotFound(path.display().to_string()),
            _ => TileError::Io(e),
        })?;
        Self::parse(&json).map_err(|e| match e {
            TileError::Parse(msg) => TileError::Parse(format!("{}: {}", path.display(), msg)),
            other => other,
        })
    }

    fn validate(&self) -> Result<()> {
        for root in &self.roots {
            if root.file.trim().is_empty() {
                return Err(TileError::Parse(format!("root '{}' has no file", root.name)));
            }
            if !root.bounds.is_valid() {
                return Err(TileError::Parse(format!("root '{}' has invalid bounds", root.name)));
            }
        }
        if let Some(m) = &self.transform {
            if m.iter().any(|v| !v.is_finite()) {
                return Err(TileError::Parse("transform has non-finite entries".into()));
            }
        }
        Ok(())
    }

    pub fn origin(&self) -> DVec3 {
        DVec3::from_array(self.origin)
    }

    /// Translation to the origin followed by the optional model transform
    pub fn location(&self) -> Mat4 {
        let translation = Mat4::from_translation(self.origin().as_vec3());
        match &self.transform {
            Some(m) => translation * Mat4::from_cols_array(m),
            None => translation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;
    use tempfile::TempDir;

    const CITY: &str = r#"{
        "name": "city",
        "coordinate_system": "EPSG:32633",
        "origin": [100.0, 0.0, -50.0],
        "roots": [
            { "name": "north", "file": "north/root.tile", "bounds": { "min": [0, 0, 0], "max": [10, 5, 10] } },
            { "name": "south", "file": "south/root.tile", "bounds": { "min": [0, 0, -10], "max": [10, 5, 0] } }
        ]
    }"#;

    #[test]
    fn test_parse() {
        let description = SceneDescription::parse(CITY).unwrap();
        assert_eq!(description.name, "city");
        assert_eq!(description.coordinate_system.as_deref(), Some("EPSG:32633"));
        assert_eq!(description.roots.len(), 2);
        assert_eq!(description.roots[1].bounds.min, Vec3::new(0.0, 0.0, -10.0));
        assert!(description.transform.is_none());
    }

    #[test]
    fn test_location_applies_origin_then_transform() {
        let mut description = SceneDescription::parse(CITY).unwrap();
        let p = description.location().transform_point3(Vec3::ZERO);
        assert_eq!(p, Vec3::new(100.0, 0.0, -50.0));

        description.transform = Some(Mat4::from_scale(Vec3::splat(2.0)).to_cols_array());
        let p = description.location().transform_point3(Vec3::ONE);
        assert_eq!(p, Vec3::new(102.0, 2.0, -48.0));
    }

    #[test]
    fn test_rejects_invalid_roots() {
        let json = r#"{ "name": "x", "roots": [ { "name": "a", "file": "", "bounds": { "min": [0,0,0], "max": [1,1,1] } } ] }"#;
        assert!(matches!(SceneDescription::parse(json), Err(TileError::Parse(_))));

        let json = r#"{ "name": "x", "roots": [ { "name": "a", "file": "a.tile", "bounds": { "min": [2,0,0], "max": [1,1,1] } } ] }"#;
        assert!(SceneDescription::parse(json).is_err());

        assert!(SceneDescription::parse("{ not json").is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = SceneDescription::load(&dir.path().join("scene.json")).unwrap_err();
        assert!(matches!(err, TileError::NotFound(_)));
    }
}

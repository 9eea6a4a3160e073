//! Mount options and mount summaries

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cdrom::TrackSummary;
use crate::disk::{DiskSummary, Geometry};
use crate::error::{ImageError, Result};

/// What kind of drive an image is mounted as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    /// Decide from extension and content
    #[default]
    Auto,
    Cdrom,
    Floppy,
    HardDisk,
}

/// Options accepted by `mount`
///
/// Loadable from a JSON mount profile; missing fields take their defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountOptions {
    pub sector_size: Option<u32>,
    pub sectors_per_track: Option<u32>,
    pub heads: Option<u32>,
    pub cylinders: Option<u32>,
    /// Never write back to the image
    pub read_only: bool,
    /// Accept CHDs that mix 2048 and 2352 byte data tracks
    pub skip_sync: bool,
    pub media: MediaKind,
    /// Mount the El Torito boot floppy of a CD image instead of the disc
    pub el_torito: bool,
}

impl MountOptions {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| ImageError::io(path, e))?;
        serde_json::from_str(&text).map_err(|e| {
            ImageError::InvalidImage(format!("mount options {}: {}", path.display(), e))
        })
    }

    /// Geometry given on the command line, only when all four values are set
    pub fn user_geometry(&self) -> Option<Geometry> {
        match (self.sector_size, self.sectors_per_track, self.heads, self.cylinders) {
            (Some(size), Some(spt), Some(heads), Some(cyl)) => Some(Geometry::new(size, spt, heads, cyl)),
            (None, None, None, None) => None,
            partial => {
                warn!(?partial, "Incomplete geometry ignored; give sector size, sectors, heads and cylinders");
                None
            }
        }
    }
}

/// Serializable description of a mounted image
#[derive(Debug, Clone, Serialize)]
pub struct MountInfo {
    pub kind: MediaKind,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracks: Option<Vec<TrackSummary>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leadout: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mcn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk: Option<DiskSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_options_from_json_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hdd.json");
        fs::write(
            &path,
            r#"{ "sector_size": 512, "sectors_per_track": 63, "heads": 16, "cylinders": 20, "media": "hard_disk" }"#,
        )
        .unwrap();

        let options = MountOptions::from_json_file(&path).unwrap();
        assert_eq!(options.media, MediaKind::HardDisk);
        assert!(!options.read_only);
        assert_eq!(options.user_geometry(), Some(Geometry::new(512, 63, 16, 20)));
    }

    #[test]
    fn test_partial_geometry_ignored() {
        let options = MountOptions {
            heads: Some(16),
            ..Default::default()
        };
        assert_eq!(options.user_geometry(), None);
    }

    #[test]
    fn test_bad_json_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, "{ read_only: yes }").unwrap();
        assert!(MountOptions::from_json_file(&path).is_err());
        assert!(MountOptions::from_json_file(&dir.path().join("none.json")).is_err());
    }
}

//! Component configuration.
//!
//! A `SortConfig` can be built in code, or loaded from a TOML file:
//!
//! ```toml
//! simulation_speed = 1.0
//! surface_width = 1024
//! surface_height = 1024
//! feature_level = "sm5"
//! screenshot_dir = "Saved/Screenshots"
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::SortError;
use crate::geometry::{MATRIX_HEIGHT, MATRIX_WIDTH};

/// Shader capability tier of the target device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureLevel {
    Es2,
    #[serde(rename = "es3_1")]
    Es31,
    Sm4,
    Sm5,
}

impl FeatureLevel {
    /// Whether compute kernels with unordered access views are available.
    pub fn supports_compute(self) -> bool {
        matches!(self, FeatureLevel::Es31 | FeatureLevel::Sm5)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SortConfig {
    /// Constant scalar rate handed to every kernel invocation.
    pub simulation_speed: f32,
    pub surface_width: u32,
    pub surface_height: u32,
    pub feature_level: FeatureLevel,
    /// Directory captures are written to.
    pub screenshot_dir: PathBuf,
}

impl Default for SortConfig {
    fn default() -> Self {
        SortConfig {
            simulation_speed: 1.0,
            surface_width: MATRIX_WIDTH,
            surface_height: MATRIX_HEIGHT,
            feature_level: FeatureLevel::Sm5,
            screenshot_dir: PathBuf::from("Saved/Screenshots"),
        }
    }
}

impl SortConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, SortError> {
        Ok(toml::from_str(content)?)
    }

    pub fn load(path: &Path) -> Result<Self, SortError> {
        let content = fs::read_to_string(path).map_err(SortError::ConfigRead)?;
        Self::from_toml_str(&content)
    }
}

use std::path::Path;

use serde::Deserialize;

use crate::{error::SceneError, scene::prepare::MIN_INSTANCE_COUNT};

/// Settings that select how the scene is turned into acceleration structures.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    // true == nested TLAS per internal node, false == collapse to one TLAS over BLASes
    pub use_multi_level: bool,
    // maximum number of instances a single TLAS may reference
    pub max_instance_count: u32,
    // binding slot of the acceleration structure descriptor
    pub descriptor_binding: u32,
    // build with PREFER_FAST_TRACE instead of PREFER_FAST_BUILD
    pub prefer_fast_trace: bool,
}

impl Default for BuildConfig {
    fn default() -> BuildConfig {
        BuildConfig {
            use_multi_level: false,
            max_instance_count: 1 << 22,
            descriptor_binding: 0,
            prefer_fast_trace: true,
        }
    }
}

impl BuildConfig {
    pub fn load(path: &Path) -> Result<BuildConfig, SceneError> {
        let text = std::fs::read_to_string(path).map_err(|source| SceneError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<BuildConfig, SceneError> {
        let config: BuildConfig = serde_json::from_str(text)?;
        if config.max_instance_count < MIN_INSTANCE_COUNT {
            return Err(SceneError::InstanceLimitTooSmall {
                limit: config.max_instance_count,
                minimum: MIN_INSTANCE_COUNT,
            });
        }
        Ok(config)
    }
}

use crate::{ResourceError, ResourceResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const CONFIG_FILE_NAME: &str = "residency.json";

const BYTES_PER_MB: u64 = 1024 * 1024;

// On-disk form, every field is optional and falls back to CacheConfiguration::default()
#[derive(Serialize, Deserialize, Default)]
pub struct CacheConfigurationJson {
    #[serde(default)]
    pub host_ram_budget_mb: Option<u64>,
    #[serde(default)]
    pub gpu_ram_budget_mb: Option<u64>,
    #[serde(default)]
    pub initial_allowance: Option<f32>,
    #[serde(default)]
    pub worker_thread_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CacheConfiguration {
    // Host memory the cache tries to stay under before evicting unused resources
    pub host_ram_budget_bytes: u64,

    // GPU memory the cache tries to stay under before evicting unused GPU-backed resources
    pub gpu_ram_budget_bytes: u64,

    // Number of loads the worker may perform before the application has to replenish it with
    // set_allowance()
    pub initial_allowance: f32,

    pub worker_thread_name: String,
}

impl Default for CacheConfiguration {
    fn default() -> Self {
        CacheConfiguration {
            host_ram_budget_bytes: 1024 * BYTES_PER_MB,
            gpu_ram_budget_bytes: 512 * BYTES_PER_MB,
            initial_allowance: 64.0,
            worker_thread_name: "Resource Loader".to_string(),
        }
    }
}

impl CacheConfiguration {
    pub fn from_json(json: CacheConfigurationJson) -> ResourceResult<Self> {
        let defaults = CacheConfiguration::default();

        let initial_allowance = json
            .initial_allowance
            .unwrap_or(defaults.initial_allowance);
        if !initial_allowance.is_finite() {
            return Err(ResourceError::StringError(format!(
                "initial_allowance must be finite, got {}",
                initial_allowance
            )));
        }

        Ok(CacheConfiguration {
            host_ram_budget_bytes: json
                .host_ram_budget_mb
                .map(|mb| mb.saturating_mul(BYTES_PER_MB))
                .unwrap_or(defaults.host_ram_budget_bytes),
            gpu_ram_budget_bytes: json
                .gpu_ram_budget_mb
                .map(|mb| mb.saturating_mul(BYTES_PER_MB))
                .unwrap_or(defaults.gpu_ram_budget_bytes),
            initial_allowance,
            worker_thread_name: json
                .worker_thread_name
                .unwrap_or(defaults.worker_thread_name),
        })
    }

    pub fn from_json_str(json: &str) -> ResourceResult<Self> {
        let config_file: CacheConfigurationJson = serde_json::from_str(json)?;
        Self::from_json(config_file)
    }

    pub fn read_from_path(path: &Path) -> ResourceResult<Self> {
        let file_contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&file_contents)
    }

    pub fn locate_config_file(search_location: &Path) -> ResourceResult<Self> {
        let mut path = Some(search_location.to_path_buf());
        while let Some(p) = path {
            let joined_path = p.join(CONFIG_FILE_NAME);
            if joined_path.exists() {
                log::info!("Using cache configuration at {:?}", joined_path);
                return Self::read_from_path(&joined_path);
            }

            path = p.parent().map(|x| x.to_path_buf());
        }

        Err(ResourceError::StringError(format!(
            "{} could not be located at {:?} or in any of its parent directories",
            CONFIG_FILE_NAME, search_location
        )))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn missing_fields_use_defaults() {
        let config = CacheConfiguration::from_json_str(r#"{ "gpu_ram_budget_mb": 3 }"#).unwrap();
        let defaults = CacheConfiguration::default();
        assert_eq!(config.gpu_ram_budget_bytes, 3 * 1024 * 1024);
        assert_eq!(config.host_ram_budget_bytes, defaults.host_ram_budget_bytes);
        assert_eq!(config.initial_allowance, defaults.initial_allowance);
        assert_eq!(config.worker_thread_name, defaults.worker_thread_name);
    }

    #[test]
    fn malformed_json_is_a_json_error() {
        let result = CacheConfiguration::from_json_str("{ host_ram_budget_mb: ");
        assert!(matches!(result, Err(ResourceError::JsonError(_))));
    }

    #[test]
    fn locate_walks_up_to_parent_directories() {
        let root = std::env::temp_dir().join(format!(
            "residency_config_test_{}",
            std::process::id()
        ));
        let nested = root.join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(
            root.join(CONFIG_FILE_NAME),
            r#"{ "initial_allowance": 4.0, "worker_thread_name": "Test Loader" }"#,
        )
        .unwrap();

        let config = CacheConfiguration::locate_config_file(&nested).unwrap();
        assert_eq!(config.initial_allowance, 4.0);
        assert_eq!(config.worker_thread_name, "Test Loader");

        std::fs::remove_dir_all(&root).unwrap();
    }
}

//! Per-operation configuration consumed by providers.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Name of the state directory created under the user's home.
pub const HOME_DIR_NAME: &str = ".vmfleet";

/// Directory backends write console logs to.
pub const DEFAULT_LOG_DIR: &str = "/tmp";

/// Memory given to a VM when the caller does not ask for a size.
pub const DEFAULT_MEMORY: &str = "1G";

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Cloud-side settings
    pub cloud_config: ProviderConfig,
    /// Settings for the instance being run
    pub run_config: RunConfig,
    /// Environment passed to the guest
    pub env: HashMap<String, String>,
    /// Override for the local volume directory
    pub volumes_dir: Option<PathBuf>,
    /// Root of all local state (images, instances, volumes)
    pub home: PathBuf,
    /// Program baked into built images
    pub program: String,
    /// Arguments for `program`
    pub args: Vec<String>,
    /// Size of the base volume of built images
    pub base_volume_size: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cloud_config: ProviderConfig::default(),
            run_config: RunConfig::default(),
            env: HashMap::new(),
            volumes_dir: None,
            home: default_home(),
            program: String::new(),
            args: Vec::new(),
            base_volume_size: String::new(),
        }
    }
}

/// `~/.vmfleet`, or a directory under the system temp dir when there is no home.
pub fn default_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(HOME_DIR_NAME)
}

impl Config {
    /// Configuration rooted at `home`.
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            ..Default::default()
        }
    }

    pub fn images_dir(&self) -> PathBuf {
        self.home.join("images")
    }

    pub fn instances_dir(&self) -> PathBuf {
        self.home.join("instances")
    }

    pub fn volumes_dir(&self) -> PathBuf {
        self.volumes_dir
            .clone()
            .unwrap_or_else(|| self.home.join("volumes"))
    }

    pub fn vdi_images_dir(&self) -> PathBuf {
        self.home.join("vdi-images")
    }

    pub fn virtualbox_vms_dir(&self) -> PathBuf {
        self.home.join("virtualbox").join("vms")
    }

    /// Instance name, falling back to the image name.
    pub fn instance_name(&self) -> &str {
        if self.run_config.instance_name.is_empty() {
            &self.cloud_config.image_name
        } else {
            &self.run_config.instance_name
        }
    }

    /// Local path of the configured image.
    pub fn image_path(&self) -> PathBuf {
        if self.run_config.image_path.is_empty() {
            self.images_dir().join(&self.cloud_config.image_name)
        } else {
            PathBuf::from(&self.run_config.image_path)
        }
    }

    /// Console log file for `name`.
    pub fn log_path(&self, name: &str) -> PathBuf {
        self.run_config.log_dir.join(format!("{}.log", name))
    }
}

/// Cloud-side settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub image_name: String,
    pub flavor: String,
    pub platform: String,
    pub zone: String,
    pub project_id: String,
    pub tags: Vec<Tag>,
}

/// Key/value label attached to cloud resources.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

/// Settings for the instance being run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub instance_name: String,
    /// Explicit image path; derived from the image name when empty
    pub image_path: String,
    /// Guest ports to expose; entries that are not integers are skipped
    pub ports: Vec<String>,
    pub memory: String,
    /// Boot volume size in GB for clouds that boot from volume
    pub volume_size_gb: u32,
    pub bridged: bool,
    pub private_ip: String,
    pub mac: String,
    /// Use hardware acceleration when available
    pub accel: bool,
    /// Render list output as JSON instead of a table
    pub json: bool,
    pub log_dir: PathBuf,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            instance_name: String::new(),
            image_path: String::new(),
            ports: Vec::new(),
            memory: DEFAULT_MEMORY.to_string(),
            volume_size_gb: 1,
            bridged: false,
            private_ip: String::new(),
            mac: String::new(),
            accel: true,
            json: false,
            log_dir: PathBuf::from(DEFAULT_LOG_DIR),
        }
    }
}

impl RunConfig {
    /// Ports that parse as integers, in declaration order.
    pub fn numeric_ports(&self) -> Vec<u16> {
        self.ports
            .iter()
            .filter_map(|p| p.trim().parse::<u16>().ok())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_dirs_follow_home() {
        let config = Config::with_home("/srv/fleet");
        assert_eq!(config.images_dir(), PathBuf::from("/srv/fleet/images"));
        assert_eq!(config.volumes_dir(), PathBuf::from("/srv/fleet/volumes"));
        assert_eq!(
            config.virtualbox_vms_dir(),
            PathBuf::from("/srv/fleet/virtualbox/vms")
        );
    }

    #[test]
    fn test_volumes_dir_override() {
        let mut config = Config::with_home("/srv/fleet");
        config.volumes_dir = Some(PathBuf::from("/data/volumes"));
        assert_eq!(config.volumes_dir(), PathBuf::from("/data/volumes"));
    }

    #[test]
    fn test_instance_name_falls_back_to_image() {
        let mut config = Config::default();
        config.cloud_config.image_name = "nginx".to_string();
        assert_eq!(config.instance_name(), "nginx");

        config.run_config.instance_name = "web-1".to_string();
        assert_eq!(config.instance_name(), "web-1");
    }

    #[test]
    fn test_numeric_ports_skips_garbage() {
        let run = RunConfig {
            ports: vec!["80".to_string(), "http".to_string(), " 443 ".to_string()],
            ..Default::default()
        };
        assert_eq!(run.numeric_ports(), vec![80, 443]);
    }

    #[test]
    fn test_deserialize_partial_config_fills_defaults() {
        let config: Config = serde_json::from_str(
            r#"{"cloud_config": {"image_name": "redis"}, "run_config": {"ports": ["6379"]}}"#,
        )
        .unwrap();
        assert_eq!(config.cloud_config.image_name, "redis");
        assert_eq!(config.run_config.memory, DEFAULT_MEMORY);
        assert_eq!(config.run_config.log_dir, PathBuf::from(DEFAULT_LOG_DIR));
    }
}

//! Local (on-premises) QEMU backend.
//!
//! Images are raw files under `<home>/images`. Every running VM has a small
//! JSON record in `<home>/instances` named after its pid; records whose
//! process has exited are cleaned up on the next listing. Lifecycle and
//! volume hot-plug go through the VM's QMP monitor.

mod qemu;

pub use qemu::{Hypervisor, LaunchSpec, Qemu};

use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{info, instrument, warn};

use crate::builder::ExternalImageBuilder;
use crate::config::{Config, ProviderConfig};
use crate::context::Context;
use crate::error::{ProviderError, Result};
use crate::qmp::QmpClient;
use crate::traits::{ImageBuilder, Provider};
use crate::types::*;
use crate::units::parse_size;
use crate::volume::LocalVolumes;

pub const BACKEND: &str = "onprem";

const LOOPBACK_IP: &str = "127.0.0.1";
const LOG_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Persisted description of a running local VM.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceRecord {
    pub instance: String,
    pub image: String,
    pub ports: Vec<String>,
    pub bridged: bool,
    pub private_ip: String,
    pub mac: String,
    pub pid: u32,
    /// QMP port on localhost
    pub mgmt: u16,
}

/// Local QEMU provider.
pub struct LocalProvider {
    hypervisor: Arc<dyn Hypervisor>,
    builder: Arc<dyn ImageBuilder>,
}

impl LocalProvider {
    pub fn new() -> Self {
        Self::with_parts(
            Arc::new(Qemu::default()),
            Arc::new(ExternalImageBuilder::default()),
        )
    }

    pub fn with_parts(hypervisor: Arc<dyn Hypervisor>, builder: Arc<dyn ImageBuilder>) -> Self {
        Self { hypervisor, builder }
    }

    fn image_file(config: &Config, name: &str) -> PathBuf {
        config.images_dir().join(name)
    }

    async fn ensure_dir(dir: &Path) -> Result<()> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| ProviderError::io(dir, e))
    }

    /// Live instance records with their record files. Stale records are removed.
    async fn records(&self, config: &Config) -> Result<Vec<(PathBuf, InstanceRecord)>> {
        let dir = config.instances_dir();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ProviderError::io(&dir, e)),
        };

        let mut records = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ProviderError::io(&dir, e))?
        {
            let path = entry.path();
            let Some(pid) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.parse::<u32>().ok())
            else {
                continue;
            };

            let body = tokio::fs::read(&path)
                .await
                .map_err(|e| ProviderError::io(&path, e))?;
            let mut record: InstanceRecord = match serde_json::from_slice(&body) {
                Ok(record) => record,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable instance record");
                    continue;
                }
            };
            record.pid = pid;

            if !self.hypervisor.is_running(pid) {
                info!(pid, instance = %record.instance, "Removing record of exited instance");
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    warn!(path = %path.display(), error = %e, "Failed to remove stale record");
                }
                continue;
            }
            records.push((path, record));
        }
        Ok(records)
    }

    async fn record_by_name(&self, config: &Config, name: &str) -> Result<(PathBuf, InstanceRecord)> {
        self.records(config)
            .await?
            .into_iter()
            .find(|(_, r)| r.instance == name)
            .ok_or_else(|| ProviderError::not_found("instance", name))
    }

    async fn qmp(&self, config: &Config, name: &str, commands: &[(&str, Option<serde_json::Value>)]) -> Result<()> {
        let (_, record) = self.record_by_name(config, name).await?;
        let mut client = QmpClient::connect(record.mgmt).await?;
        for (command, arguments) in commands {
            client.execute(command, arguments.clone()).await?;
        }
        Ok(())
    }

    async fn to_instance(path: &Path, record: InstanceRecord) -> CloudInstance {
        let created = tokio::fs::metadata(path)
            .await
            .and_then(|m| m.modified())
            .map(|t| DateTime::<Local>::from(t).format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();

        let private_ip = if record.bridged && !record.private_ip.is_empty() {
            record.private_ip.clone()
        } else {
            LOOPBACK_IP.to_string()
        };

        CloudInstance {
            id: record.pid.to_string(),
            name: record.instance,
            status: "Running".to_string(),
            created,
            private_ips: vec![private_ip],
            public_ips: Vec::new(),
            image: record.image,
            ports: record.ports,
        }
    }
}

impl Default for LocalProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for LocalProvider {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn initialize(&mut self, _config: &ProviderConfig) -> Result<()> {
        Ok(())
    }

    // =========================================================================
    // Images
    // =========================================================================

    async fn build_image(&self, ctx: &Context) -> Result<PathBuf> {
        self.builder.build_image(ctx.config()).await
    }

    async fn build_image_with_package(&self, ctx: &Context, package: &Path) -> Result<PathBuf> {
        self.builder
            .build_image_from_package(package, ctx.config())
            .await
    }

    /// Copy an image into the local image store under the configured name.
    #[instrument(skip(self, ctx), fields(image = %ctx.config().cloud_config.image_name))]
    async fn create_image(&self, ctx: &Context, image_path: &Path) -> Result<()> {
        let config = ctx.config();
        let target = Self::image_file(config, &config.cloud_config.image_name);
        if target == image_path {
            return Ok(());
        }
        Self::ensure_dir(&config.images_dir()).await?;
        tokio::fs::copy(image_path, &target)
            .await
            .map_err(|e| ProviderError::io(image_path, e))?;
        info!(path = %target.display(), "Image stored");
        Ok(())
    }

    async fn get_images(&self, ctx: &Context) -> Result<Vec<CloudImage>> {
        let dir = ctx.config().images_dir();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ProviderError::io(&dir, e)),
        };

        let mut images = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ProviderError::io(&dir, e))?
        {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let metadata = entry
                .metadata()
                .await
                .map_err(|e| ProviderError::io(&path, e))?;
            if !metadata.is_file() {
                continue;
            }
            images.push(CloudImage {
                id: name.clone(),
                name,
                status: String::new(),
                path: path.display().to_string(),
                size: metadata.len() as i64,
                created_at: metadata.modified().ok().map(DateTime::<Utc>::from),
            });
        }

        images.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(images)
    }

    #[instrument(skip(self, ctx))]
    async fn delete_image(&self, ctx: &Context, name: &str) -> Result<()> {
        let path = Self::image_file(ctx.config(), name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!("Image deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ProviderError::not_found("image", name))
            }
            Err(e) => Err(ProviderError::io(path, e)),
        }
    }

    /// Grow the image file to `size`. Shrinking is refused since it would
    /// cut off the end of the filesystem.
    #[instrument(skip(self, ctx))]
    async fn resize_image(&self, ctx: &Context, name: &str, size: &str) -> Result<()> {
        let path = Self::image_file(ctx.config(), name);
        let bytes = parse_size(size)?;

        let file = match tokio::fs::OpenOptions::new().write(true).open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ProviderError::not_found("image", name))
            }
            Err(e) => return Err(ProviderError::io(path, e)),
        };
        let current = file
            .metadata()
            .await
            .map_err(|e| ProviderError::io(&path, e))?
            .len();
        if bytes < current {
            return Err(ProviderError::InvalidConfig(format!(
                "cannot shrink image {} from {} to {} bytes",
                name, current, bytes
            )));
        }

        file.set_len(bytes)
            .await
            .map_err(|e| ProviderError::io(&path, e))?;
        info!(bytes, "Image resized");
        Ok(())
    }

    /// Push a local image to `target`: the target prepares the image for
    /// upload and then registers it.
    #[instrument(skip(self, config, target), fields(target = target.name()))]
    async fn sync_image(&self, config: &Config, target: &dyn Provider, name: &str) -> Result<()> {
        let path = Self::image_file(config, name);
        if !path.exists() {
            return Err(ProviderError::not_found("image", name));
        }

        let mut config = config.clone();
        config.cloud_config.image_name = name.to_string();
        config.run_config.image_path = path.display().to_string();
        let ctx = Context::new(config);

        let prepared = target.customize_image(&ctx).await?;
        target.create_image(&ctx, &prepared).await?;
        info!("Image synced");
        Ok(())
    }

    async fn customize_image(&self, ctx: &Context) -> Result<PathBuf> {
        let path = ctx.config().image_path();
        if !path.exists() {
            return Err(ProviderError::not_found("image", path.display().to_string()));
        }
        Ok(path)
    }

    // =========================================================================
    // Instances
    // =========================================================================

    #[instrument(skip(self, ctx), fields(image = %ctx.config().cloud_config.image_name))]
    async fn create_instance(&self, ctx: &Context) -> Result<()> {
        let config = ctx.config();
        let image_name = &config.cloud_config.image_name;
        let image = Self::image_file(config, image_name);
        if !image.exists() {
            return Err(ProviderError::not_found("image", image_name.as_str()));
        }

        let name = config.instance_name().to_string();

        let instances_dir = config.instances_dir();
        Self::ensure_dir(&instances_dir).await?;

        let spec = LaunchSpec {
            name: name.clone(),
            image: image.clone(),
            memory: config.run_config.memory.clone(),
            ports: config.run_config.numeric_ports(),
            mgmt_port: rand::thread_rng().gen_range(40000..50000),
            log: config.log_path(&name),
            accel: config.run_config.accel,
            bridged: config.run_config.bridged,
            mac: config.run_config.mac.clone(),
        };

        info!(instance = %name, "Booting instance");
        let pid_file = instances_dir.join(format!(".{}.pid", uuid::Uuid::new_v4()));
        let pid = self.hypervisor.launch(&spec, &pid_file).await?;

        let record = InstanceRecord {
            instance: name,
            image: image.display().to_string(),
            ports: config.run_config.ports.clone(),
            bridged: config.run_config.bridged,
            private_ip: config.run_config.private_ip.clone(),
            mac: config.run_config.mac.clone(),
            pid,
            mgmt: spec.mgmt_port,
        };
        let record_path = instances_dir.join(pid.to_string());
        let body = serde_json::to_vec(&record)
            .map_err(|e| ProviderError::InvalidConfig(e.to_string()))?;
        tokio::fs::write(&record_path, body)
            .await
            .map_err(|e| ProviderError::io(&record_path, e))?;

        info!(pid, "Instance started");
        Ok(())
    }

    async fn get_instances(&self, ctx: &Context) -> Result<Vec<CloudInstance>> {
        let mut instances = Vec::new();
        for (path, record) in self.records(ctx.config()).await? {
            instances.push(Self::to_instance(&path, record).await);
        }
        instances.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(instances)
    }

    #[instrument(skip(self, ctx))]
    async fn delete_instance(&self, ctx: &Context, name: &str) -> Result<()> {
        let (path, record) = self.record_by_name(ctx.config(), name).await?;

        if let Err(e) = self.hypervisor.terminate(record.pid) {
            warn!(pid = record.pid, error = %e, "Failed to signal instance");
        }
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| ProviderError::io(&path, e))?;
        info!(pid = record.pid, "Instance deleted");
        Ok(())
    }

    async fn start_instance(&self, ctx: &Context, name: &str) -> Result<()> {
        self.qmp(ctx.config(), name, &[("cont", None)]).await
    }

    async fn stop_instance(&self, ctx: &Context, name: &str) -> Result<()> {
        self.qmp(ctx.config(), name, &[("stop", None)]).await
    }

    async fn reset_instance(&self, ctx: &Context, name: &str) -> Result<()> {
        self.qmp(ctx.config(), name, &[("system_reset", None)]).await
    }

    async fn get_instance_logs(&self, ctx: &Context, name: &str) -> Result<String> {
        let path = ctx.config().log_path(name);
        match tokio::fs::read_to_string(&path).await {
            Ok(logs) => Ok(logs),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ProviderError::not_found("instance log", path.display().to_string()))
            }
            Err(e) => Err(ProviderError::io(path, e)),
        }
    }

    /// With `watch`, keeps printing appended output until Ctrl-C.
    async fn print_instance_logs(&self, ctx: &Context, name: &str, watch: bool) -> Result<()> {
        let path = ctx.config().log_path(name);
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ProviderError::not_found("instance log", path.display().to_string()))
            }
            Err(e) => return Err(ProviderError::io(path, e)),
        };

        let mut stdout = tokio::io::stdout();
        let mut buf = Vec::new();
        loop {
            buf.clear();
            file.read_to_end(&mut buf)
                .await
                .map_err(|e| ProviderError::io(&path, e))?;
            stdout
                .write_all(&buf)
                .await
                .map_err(|e| ProviderError::io("<stdout>", e))?;
            stdout
                .flush()
                .await
                .map_err(|e| ProviderError::io("<stdout>", e))?;

            if !watch {
                return Ok(());
            }

            tokio::select! {
                _ = tokio::time::sleep(LOG_POLL_INTERVAL) => {}
                _ = tokio::signal::ctrl_c() => return Ok(()),
            }

            // Start over if the log was truncated by a restart.
            let position = file
                .stream_position()
                .await
                .map_err(|e| ProviderError::io(&path, e))?;
            let length = file
                .metadata()
                .await
                .map_err(|e| ProviderError::io(&path, e))?
                .len();
            if length < position {
                file.rewind().await.map_err(|e| ProviderError::io(&path, e))?;
            }
        }
    }

    // =========================================================================
    // Volumes
    // =========================================================================

    async fn create_volume(
        &self,
        ctx: &Context,
        name: &str,
        data: Option<&Path>,
        size: &str,
        _provider: &str,
    ) -> Result<NanosVolume> {
        LocalVolumes::new(ctx.config().volumes_dir())
            .create(self.builder.as_ref(), name, data, size)
            .await
    }

    async fn get_all_volumes(&self, ctx: &Context) -> Result<Vec<NanosVolume>> {
        LocalVolumes::new(ctx.config().volumes_dir()).list().await
    }

    async fn delete_volume(&self, ctx: &Context, name: &str) -> Result<()> {
        LocalVolumes::new(ctx.config().volumes_dir())
            .delete(name)
            .await
            .map(|_| ())
    }

    /// Hot-plug the volume as a SCSI disk. The instance must have been
    /// started by this provider so its QMP monitor is reachable.
    #[instrument(skip(self, ctx))]
    async fn attach_volume(
        &self,
        ctx: &Context,
        instance: &str,
        name: &str,
        attach_slot: Option<u32>,
    ) -> Result<()> {
        let volume = LocalVolumes::new(ctx.config().volumes_dir()).find(name).await?;

        let mut device = json!({
            "driver": "scsi-hd",
            "bus": "scsi0.0",
            "drive": volume.name,
            "id": volume.name,
        });
        if let Some(slot) = attach_slot {
            device["device_id"] = json!(format!("persistent-disk-{}", slot));
        }

        self.qmp(
            ctx.config(),
            instance,
            &[
                (
                    "blockdev-add",
                    Some(json!({
                        "driver": "raw",
                        "node-name": volume.name,
                        "file": { "driver": "file", "filename": volume.path },
                    })),
                ),
                ("device_add", Some(device)),
            ],
        )
        .await?;
        info!("Volume attached");
        Ok(())
    }

    #[instrument(skip(self, ctx))]
    async fn detach_volume(&self, ctx: &Context, instance: &str, name: &str) -> Result<()> {
        let volume = LocalVolumes::new(ctx.config().volumes_dir()).find(name).await?;

        self.qmp(
            ctx.config(),
            instance,
            &[
                ("device_del", Some(json!({ "id": volume.name }))),
                ("blockdev-del", Some(json!({ "node-name": volume.name }))),
            ],
        )
        .await?;
        info!("Volume detached");
        Ok(())
    }
}

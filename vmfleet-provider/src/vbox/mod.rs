//! VirtualBox backend for desktop hosts.
//!
//! Images are kept as VDI files under `<home>/vdi-images`. Each instance
//! boots from its own clone of the image placed next to the machine under
//! `<home>/virtualbox/vms`. Under WSL every path handed to VirtualBox is
//! translated to Windows form first.

mod manage;

pub use manage::*;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::builder::ExternalImageBuilder;
use crate::config::{Config, ProviderConfig};
use crate::context::Context;
use crate::error::{ProviderError, Result};
use crate::exec::run_program;
use crate::traits::{ImageBuilder, Provider};
use crate::types::*;
use crate::units::parse_size;
use crate::volume::LocalVolumes;
use crate::wsl::PathTranslator;

pub const BACKEND: &str = "vbox";

/// Name of the storage controller the boot disk is attached to.
pub const STORAGE_CONTROLLER: &str = "IDE";

/// NIC slot used for the NAT interface and its port forwards.
pub const NAT_SLOT: u8 = 1;

/// Guest properties recording what an instance was created from.
pub const IMAGE_PROPERTY: &str = "Image";
pub const PORTS_PROPERTY: &str = "Ports";

/// NAT forwards are reachable on the host's loopback address.
const FORWARD_IP: &str = "127.0.0.1";

const VDI_EXTENSION: &str = "vdi";

const MIB: u64 = 1024 * 1024;

/// VirtualBox provider.
pub struct VirtualBoxProvider {
    vbox: Arc<dyn VirtualBox>,
    builder: Arc<dyn ImageBuilder>,
    paths: PathTranslator,
    qemu_img: String,
}

impl VirtualBoxProvider {
    pub fn new() -> Self {
        Self::with_parts(
            Arc::new(VBoxManage::default()),
            Arc::new(ExternalImageBuilder::default()),
        )
    }

    /// Provider driving `vbox` and building images with `builder`.
    pub fn with_parts(vbox: Arc<dyn VirtualBox>, builder: Arc<dyn ImageBuilder>) -> Self {
        Self {
            vbox,
            builder,
            paths: PathTranslator::native(),
            qemu_img: "qemu-img".to_string(),
        }
    }

    /// Instance view of `machine`, with the image and ports recorded at
    /// creation. Unreadable properties are left empty.
    async fn describe(&self, machine: Machine) -> CloudInstance {
        let image = self.guest_property(&machine.name, IMAGE_PROPERTY).await;
        let ports = self.guest_property(&machine.name, PORTS_PROPERTY).await;
        CloudInstance {
            id: machine.uuid,
            name: machine.name,
            status: machine.state,
            public_ips: vec![FORWARD_IP.to_string()],
            image,
            ports: ports
                .split(',')
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect(),
            ..Default::default()
        }
    }

    async fn guest_property(&self, vm: &str, key: &str) -> String {
        match self.vbox.get_guest_property(vm, key).await {
            Ok(value) => value.unwrap_or_default(),
            Err(e) => {
                debug!(vm = %vm, key = %key, error = %e, "Guest property unavailable");
                String::new()
            }
        }
    }

    async fn ensure_dir(dir: &Path) -> Result<()> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| ProviderError::io(dir, e))
    }

    fn vdi_path(config: &Config, image_name: &str) -> PathBuf {
        let file = if image_name.ends_with(".vdi") {
            image_name.to_string()
        } else {
            format!("{}.{}", image_name, VDI_EXTENSION)
        };
        config.vdi_images_dir().join(file)
    }

    /// Convert a raw image into `<vdi-images>/<name>.vdi`.
    async fn convert_to_vdi(&self, config: &Config, raw: &Path) -> Result<PathBuf> {
        let vdi_dir = config.vdi_images_dir();
        Self::ensure_dir(&vdi_dir).await?;

        let target = Self::vdi_path(config, image_stem(&config.cloud_config.image_name));
        let raw_arg = raw.display().to_string();
        let target_arg = target.display().to_string();

        vmfleet_common::Spinner::wrap(
            "converting image to VDI",
            run_program(&self.qemu_img, &["convert", "-O", "vdi", &raw_arg, &target_arg]),
        )
        .await??;

        info!(raw = %raw.display(), vdi = %target.display(), "Image converted");
        Ok(target)
    }

    async fn build_and_convert(&self, config: &Config, raw: PathBuf) -> Result<PathBuf> {
        let vdi = self.convert_to_vdi(config, &raw).await?;
        if let Err(e) = tokio::fs::remove_file(&raw).await {
            warn!(path = %raw.display(), error = %e, "Failed to remove raw image");
        }
        Ok(vdi)
    }
}

impl Default for VirtualBoxProvider {
    fn default() -> Self {
        Self::new()
    }
}

/// `"app.img"` -> `"app"`; names without an extension are returned as-is.
fn image_stem(name: &str) -> &str {
    Path::new(name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(name)
}

#[async_trait]
impl Provider for VirtualBoxProvider {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn initialize(&mut self, _config: &ProviderConfig) -> Result<()> {
        self.paths = PathTranslator::detect();
        if self.paths.is_windows() {
            info!("WSL detected, VirtualBox paths will be translated");
        }
        Ok(())
    }

    // =========================================================================
    // Images
    // =========================================================================

    #[instrument(skip(self, ctx), fields(image = %ctx.config().cloud_config.image_name))]
    async fn build_image(&self, ctx: &Context) -> Result<PathBuf> {
        let raw = self.builder.build_image(ctx.config()).await?;
        self.build_and_convert(ctx.config(), raw).await
    }

    async fn build_image_with_package(&self, ctx: &Context, package: &Path) -> Result<PathBuf> {
        let raw = self
            .builder
            .build_image_from_package(package, ctx.config())
            .await?;
        self.build_and_convert(ctx.config(), raw).await
    }

    /// Convert an existing raw image into the VDI store, keeping the source.
    async fn create_image(&self, ctx: &Context, image_path: &Path) -> Result<()> {
        self.convert_to_vdi(ctx.config(), image_path).await?;
        Ok(())
    }

    async fn get_images(&self, ctx: &Context) -> Result<Vec<CloudImage>> {
        let dir = ctx.config().vdi_images_dir();
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
            if path.extension().and_then(|e| e.to_str()) != Some(VDI_EXTENSION) {
                continue;
            }
            let metadata = entry
                .metadata()
                .await
                .map_err(|e| ProviderError::io(&path, e))?;
            if !metadata.is_file() {
                continue;
            }
            let name = image_stem(&entry.file_name().to_string_lossy()).to_string();
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
        let path = Self::vdi_path(ctx.config(), name);
        if !path.exists() {
            return Err(ProviderError::not_found("image", name));
        }
        let medium = self.paths.translate(&path).await?;
        self.vbox.close_medium(&medium).await?;
        info!("Image deleted");
        Ok(())
    }

    async fn resize_image(&self, _ctx: &Context, _name: &str, _size: &str) -> Result<()> {
        Err(ProviderError::unsupported(BACKEND, "resize image"))
    }

    async fn sync_image(&self, _config: &Config, _target: &dyn Provider, _name: &str) -> Result<()> {
        Err(ProviderError::unsupported(BACKEND, "sync image"))
    }

    async fn customize_image(&self, _ctx: &Context) -> Result<PathBuf> {
        Err(ProviderError::unsupported(BACKEND, "customize image"))
    }

    // =========================================================================
    // Instances
    // =========================================================================

    /// Steps run in order and the first failure is returned as-is. Artifacts
    /// of earlier steps (cloned disk, registered machine) are left behind.
    #[instrument(skip(self, ctx), fields(instance = %ctx.config().instance_name()))]
    async fn create_instance(&self, ctx: &Context) -> Result<()> {
        let config = ctx.config();
        let name = config.instance_name().to_string();
        let image = image_stem(&config.cloud_config.image_name);

        let vms_dir = config.virtualbox_vms_dir();
        Self::ensure_dir(&vms_dir).await?;
        Self::ensure_dir(&config.vdi_images_dir()).await?;

        let image_path = self.paths.translate(&Self::vdi_path(config, image)).await?;
        let vms_path = self.paths.translate(&vms_dir).await?;
        let disk_path = self.paths.join(&vms_path, &format!("{}.{}", name, VDI_EXTENSION));

        let memory_mib = memory_mib(&config.run_config.memory)?;
        let ports = config.run_config.numeric_ports();

        let result: Result<()> = async {
            self.vbox.clone_hd(&image_path, &disk_path).await?;
            let vm = self.vbox.create_machine(&name, &vms_path).await?;

            self.vbox
                .add_storage_ctl(
                    &vm.name,
                    STORAGE_CONTROLLER,
                    &StorageController {
                        bus: SysBus::Ide,
                        ports: 2,
                        chipset: Chipset::Piix3,
                        host_io_cache: true,
                        bootable: true,
                    },
                )
                .await?;
            self.vbox
                .attach_storage(
                    &vm.name,
                    STORAGE_CONTROLLER,
                    &StorageMedium {
                        port: 0,
                        device: 0,
                        drive_type: DriveType::Hdd,
                        medium: disk_path.clone(),
                    },
                )
                .await?;

            self.vbox.set_memory(&vm.name, memory_mib).await?;
            self.vbox
                .set_guest_property(&vm.name, IMAGE_PROPERTY, image)
                .await?;
            self.vbox
                .set_nic(
                    &vm.name,
                    NAT_SLOT,
                    &Nic {
                        network: NicNetwork::Nat,
                        hardware: NicHardware::VirtIo,
                    },
                )
                .await?;

            for &port in &ports {
                self.vbox
                    .add_nat_pf(
                        &vm.name,
                        NAT_SLOT,
                        &format!("TCP:{}", port),
                        &PortForward {
                            proto: PfProto::Tcp,
                            host_port: port,
                            guest_port: port,
                        },
                    )
                    .await?;
            }
            if !ports.is_empty() {
                let joined = ports.iter().map(u16::to_string).collect::<Vec<_>>().join(",");
                self.vbox
                    .set_guest_property(&vm.name, PORTS_PROPERTY, &joined)
                    .await?;
            }

            self.vbox.start(&vm.name).await
        }
        .await;

        match &result {
            Ok(()) => info!(disk = %disk_path, "VirtualBox instance started"),
            Err(e) => warn!(disk = %disk_path, error = %e, "VirtualBox instance creation failed"),
        }
        result
    }

    async fn get_instance_by_name(&self, _ctx: &Context, name: &str) -> Result<CloudInstance> {
        let machine = self.vbox.get_machine(name).await?;
        Ok(self.describe(machine).await)
    }

    async fn get_instances(&self, _ctx: &Context) -> Result<Vec<CloudInstance>> {
        let mut instances = Vec::new();
        for machine in self.vbox.list_machines().await? {
            instances.push(self.describe(machine).await);
        }
        Ok(instances)
    }

    #[instrument(skip(self, _ctx))]
    async fn delete_instance(&self, _ctx: &Context, name: &str) -> Result<()> {
        let vm = self.vbox.get_machine(name).await?;
        self.vbox.delete_machine(&vm.name).await?;
        info!("VirtualBox instance deleted");
        Ok(())
    }

    #[instrument(skip(self, _ctx))]
    async fn start_instance(&self, _ctx: &Context, name: &str) -> Result<()> {
        let vm = self.vbox.get_machine(name).await?;
        self.vbox.start(&vm.name).await
    }

    #[instrument(skip(self, _ctx))]
    async fn stop_instance(&self, _ctx: &Context, name: &str) -> Result<()> {
        let vm = self.vbox.get_machine(name).await?;
        self.vbox.power_off(&vm.name).await
    }

    #[instrument(skip(self, _ctx))]
    async fn reset_instance(&self, _ctx: &Context, name: &str) -> Result<()> {
        let vm = self.vbox.get_machine(name).await?;
        self.vbox.reset(&vm.name).await
    }

    async fn get_instance_logs(&self, _ctx: &Context, _name: &str) -> Result<String> {
        Err(ProviderError::unsupported(BACKEND, "instance logs"))
    }

    async fn print_instance_logs(&self, _ctx: &Context, _name: &str, _watch: bool) -> Result<()> {
        Err(ProviderError::unsupported(BACKEND, "instance logs"))
    }

    // =========================================================================
    // Volumes
    // =========================================================================

    /// Builds the volume locally, then removes the staging file. VirtualBox
    /// has no volume store of its own to hand the file to.
    async fn create_volume(
        &self,
        ctx: &Context,
        name: &str,
        data: Option<&Path>,
        size: &str,
        _provider: &str,
    ) -> Result<NanosVolume> {
        let store = LocalVolumes::new(ctx.config().volumes_dir());
        let volume = store.create(self.builder.as_ref(), name, data, size).await?;
        if let Err(e) = tokio::fs::remove_file(&volume.path).await {
            warn!(path = %volume.path, error = %e, "Failed to remove staged volume");
        }
        Ok(volume)
    }

    async fn get_all_volumes(&self, _ctx: &Context) -> Result<Vec<NanosVolume>> {
        Err(ProviderError::unsupported(BACKEND, "list volumes"))
    }

    async fn delete_volume(&self, _ctx: &Context, _name: &str) -> Result<()> {
        Err(ProviderError::unsupported(BACKEND, "delete volume"))
    }

    async fn attach_volume(
        &self,
        _ctx: &Context,
        _instance: &str,
        _name: &str,
        _attach_slot: Option<u32>,
    ) -> Result<()> {
        Err(ProviderError::unsupported(BACKEND, "attach volume"))
    }

    async fn detach_volume(&self, _ctx: &Context, _instance: &str, _name: &str) -> Result<()> {
        Err(ProviderError::unsupported(BACKEND, "detach volume"))
    }
}

/// Whole MiB in `memory`, e.g. `"1G"` is 1024.
fn memory_mib(memory: &str) -> Result<u64> {
    let mib = parse_size(memory)? / MIB;
    if mib == 0 {
        return Err(ProviderError::InvalidConfig(format!(
            "memory {:?} is below 1 MiB",
            memory
        )));
    }
    Ok(mib)
}

//! Core provider abstraction trait.

use async_trait::async_trait;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::config::{Config, ProviderConfig};
use crate::context::Context;
use crate::error::{ProviderError, Result};
use crate::render;
use crate::types::*;

/// Core provider abstraction trait.
///
/// Every backend (local QEMU, bhyve, VirtualBox, OpenStack) implements this
/// trait. Operations a backend cannot perform return
/// [`ProviderError::Unsupported`] rather than silently succeeding.
///
/// A provider instance is handed out per logical operation by the registry;
/// callers needing concurrency obtain separate instances.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Registry name of the backend.
    fn name(&self) -> &'static str;

    /// Prepare the backend (credentials, host detection). Called once by the
    /// registry before the provider is handed out.
    async fn initialize(&mut self, config: &ProviderConfig) -> Result<()>;

    // =========================================================================
    // Images
    // =========================================================================

    /// Build an image from the context's program and return its local path.
    async fn build_image(&self, ctx: &Context) -> Result<PathBuf>;

    /// Build an image from a package and return its local path.
    async fn build_image_with_package(&self, ctx: &Context, package: &Path) -> Result<PathBuf>;

    /// Register a locally built image with the backend.
    async fn create_image(&self, ctx: &Context, image_path: &Path) -> Result<()>;

    /// Enumerate images resident on the backend.
    async fn get_images(&self, ctx: &Context) -> Result<Vec<CloudImage>>;

    /// Render the backend's images to stdout.
    async fn list_images(&self, ctx: &Context) -> Result<()> {
        let images = self.get_images(ctx).await?;
        let mut out = std::io::stdout().lock();
        render::images(&mut out, &images, ctx.config().run_config.json)
            .and_then(|_| out.flush())
            .map_err(|e| ProviderError::io("<stdout>", e))
    }

    /// Delete the named image.
    async fn delete_image(&self, ctx: &Context, name: &str) -> Result<()>;

    /// Resize the named image to `size` (e.g. `"2G"`).
    async fn resize_image(&self, ctx: &Context, name: &str, size: &str) -> Result<()>;

    /// Copy the named image from this backend onto `target`.
    async fn sync_image(&self, config: &Config, target: &dyn Provider, name: &str) -> Result<()>;

    /// Prepare the image for upload and return the path to push.
    async fn customize_image(&self, ctx: &Context) -> Result<PathBuf>;

    // =========================================================================
    // Instances
    // =========================================================================

    /// Create and boot an instance from the context's image.
    async fn create_instance(&self, ctx: &Context) -> Result<()>;

    /// Look an instance up by name.
    async fn get_instance_by_name(&self, ctx: &Context, name: &str) -> Result<CloudInstance> {
        self.get_instances(ctx)
            .await?
            .into_iter()
            .find(|i| i.name == name)
            .ok_or_else(|| ProviderError::not_found("instance", name))
    }

    /// Look an instance up by backend id.
    async fn get_instance_by_id(&self, ctx: &Context, id: &str) -> Result<CloudInstance> {
        self.get_instances(ctx)
            .await?
            .into_iter()
            .find(|i| i.id == id)
            .ok_or_else(|| ProviderError::not_found("instance", id))
    }

    /// Enumerate instances managed by this backend.
    async fn get_instances(&self, ctx: &Context) -> Result<Vec<CloudInstance>>;

    /// Render the backend's instances to stdout.
    async fn list_instances(&self, ctx: &Context) -> Result<()> {
        let instances = self.get_instances(ctx).await?;
        let mut out = std::io::stdout().lock();
        render::instances(&mut out, &instances, ctx.config().run_config.json)
            .and_then(|_| out.flush())
            .map_err(|e| ProviderError::io("<stdout>", e))
    }

    async fn delete_instance(&self, ctx: &Context, name: &str) -> Result<()>;

    async fn start_instance(&self, ctx: &Context, name: &str) -> Result<()>;

    async fn stop_instance(&self, ctx: &Context, name: &str) -> Result<()>;

    /// Hard-reset a running instance.
    async fn reset_instance(&self, ctx: &Context, name: &str) -> Result<()>;

    /// Fetch the instance's console output.
    async fn get_instance_logs(&self, ctx: &Context, name: &str) -> Result<String>;

    /// Print the instance's console output, following it when `watch` is set.
    async fn print_instance_logs(&self, ctx: &Context, name: &str, watch: bool) -> Result<()> {
        if watch {
            return Err(ProviderError::unsupported(self.name(), "watching instance logs"));
        }
        let logs = self.get_instance_logs(ctx, name).await?;
        let mut out = std::io::stdout().lock();
        out.write_all(logs.as_bytes())
            .and_then(|_| out.flush())
            .map_err(|e| ProviderError::io("<stdout>", e))
    }

    // =========================================================================
    // Volumes
    // =========================================================================

    /// Create a volume, optionally seeded from the directory `data`.
    async fn create_volume(
        &self,
        ctx: &Context,
        name: &str,
        data: Option<&Path>,
        size: &str,
        provider: &str,
    ) -> Result<NanosVolume>;

    async fn get_all_volumes(&self, ctx: &Context) -> Result<Vec<NanosVolume>>;

    /// Render the backend's volumes to stdout.
    async fn list_volumes(&self, ctx: &Context) -> Result<()> {
        let volumes = self.get_all_volumes(ctx).await?;
        let mut out = std::io::stdout().lock();
        render::volumes(&mut out, &volumes, ctx.config().run_config.json)
            .and_then(|_| out.flush())
            .map_err(|e| ProviderError::io("<stdout>", e))
    }

    async fn delete_volume(&self, ctx: &Context, name: &str) -> Result<()>;

    /// Attach volume `name` to `instance`, at `attach_slot` when given.
    async fn attach_volume(
        &self,
        ctx: &Context,
        instance: &str,
        name: &str,
        attach_slot: Option<u32>,
    ) -> Result<()>;

    async fn detach_volume(&self, ctx: &Context, instance: &str, name: &str) -> Result<()>;
}

/// Image and volume construction.
///
/// Building bootable images is delegated to an external toolchain; drivers
/// only consume the resulting files.
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// Build the configured program into a raw image and return its path.
    async fn build_image(&self, config: &Config) -> Result<PathBuf>;

    /// Build a raw image from `package` and return its path.
    async fn build_image_from_package(&self, package: &Path, config: &Config) -> Result<PathBuf>;

    /// Write a raw volume image at `out` holding the contents of `data`.
    async fn create_volume_image(&self, data: &Path, size: Option<u64>, out: &Path) -> Result<()>;
}

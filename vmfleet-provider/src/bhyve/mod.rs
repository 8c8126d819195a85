//! bhyve backend for FreeBSD hosts.
//!
//! Everything is driven through shell commands: each VM gets a tap device
//! bridged onto the uplink, a null-modem console device and a detached
//! `bhyve` process whose output goes to a per-instance log file. Running
//! VMs are discovered from `/dev/vmm`.
//!
//! Nothing is persisted besides what the kernel knows, so image and volume
//! operations are unsupported.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::config::{Config, ProviderConfig};
use crate::context::Context;
use crate::error::{ProviderError, Result};
use crate::exec::{shell_quote, CommandRunner, ShellRunner};
use crate::traits::Provider;
use crate::types::*;

pub const BACKEND: &str = "bhyve";

/// Bridge every tap device joins.
pub const BRIDGE: &str = "bridge0";

/// Physical interface added to the bridge with the first VM.
pub const DEFAULT_UPLINK: &str = "em0";

/// UEFI firmware shipped by the `bhyve-firmware` package.
pub const DEFAULT_FIRMWARE: &str = "/usr/local/share/uefi-firmware/BHYVE_UEFI.fd";

/// bhyve provider.
pub struct Bhyve {
    runner: Arc<dyn CommandRunner>,
    uplink: String,
    firmware: PathBuf,
}

impl Bhyve {
    pub fn new() -> Self {
        Self::with_runner(Arc::new(ShellRunner::default()))
    }

    /// Provider issuing its commands through `runner`.
    pub fn with_runner(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            uplink: DEFAULT_UPLINK.to_string(),
            firmware: PathBuf::from(DEFAULT_FIRMWARE),
        }
    }

    /// Use `uplink` instead of `em0` when creating the bridge.
    pub fn with_uplink(mut self, uplink: impl Into<String>) -> Self {
        self.uplink = uplink.into();
        self
    }

    /// The full `bhyve` command line for VM number `index`. `name` must have
    /// passed [`Bhyve::vm_name`]; every path is quoted.
    fn launch_command(&self, config: &Config, index: usize) -> String {
        let name = config.instance_name();
        format!(
            "bhyve -AHP -s 0:0,hostbridge -s 1:0,virtio-blk,{image} -s 2:0,virtio-net,tap{index} \
             -s 3:0,virtio-rnd -s 31:0,lpc -l bootrom,{firmware} -l com1,/dev/nmdm{index}A \
             {name} >> {log} 2>&1",
            image = shell_quote(&config.image_path().to_string_lossy()),
            index = index,
            firmware = shell_quote(&self.firmware.to_string_lossy()),
            name = name,
            log = shell_quote(&config.log_path(name).to_string_lossy()),
        )
    }

    async fn run_step(&self, command: &str) -> Result<()> {
        let output = self.runner.run(command).await?;
        if !output.trim().is_empty() {
            debug!(command = %command, output = %output.trim(), "bhyve host command");
        }
        Ok(())
    }

    /// Reject names that cannot be spliced into a command line as-is.
    fn vm_name(name: &str) -> Result<&str> {
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
        if valid {
            Ok(name)
        } else {
            Err(ProviderError::InvalidConfig(format!(
                "invalid bhyve VM name {:?}",
                name
            )))
        }
    }
}

impl Default for Bhyve {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for Bhyve {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn initialize(&mut self, _config: &ProviderConfig) -> Result<()> {
        Ok(())
    }

    // =========================================================================
    // Images
    // =========================================================================

    async fn build_image(&self, _ctx: &Context) -> Result<PathBuf> {
        Err(ProviderError::unsupported(BACKEND, "build image"))
    }

    async fn build_image_with_package(&self, _ctx: &Context, _package: &Path) -> Result<PathBuf> {
        Err(ProviderError::unsupported(BACKEND, "build image from package"))
    }

    async fn create_image(&self, _ctx: &Context, _image_path: &Path) -> Result<()> {
        Err(ProviderError::unsupported(BACKEND, "create image"))
    }

    async fn get_images(&self, _ctx: &Context) -> Result<Vec<CloudImage>> {
        Err(ProviderError::unsupported(BACKEND, "list images"))
    }

    async fn delete_image(&self, _ctx: &Context, _name: &str) -> Result<()> {
        Err(ProviderError::unsupported(BACKEND, "delete image"))
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

    /// Requires the `vmm` and `nmdm` kernel modules to be loaded.
    #[instrument(skip(self, ctx), fields(instance = %ctx.config().instance_name()))]
    async fn create_instance(&self, ctx: &Context) -> Result<()> {
        let config = ctx.config();
        Self::vm_name(config.instance_name())?;

        let index = self.get_instances(ctx).await?.len();
        let tap = format!("tap{}", index);

        self.run_step(&format!("ifconfig {} create", tap)).await?;
        self.run_step("sysctl net.link.tap.up_on_open=1").await?;
        if index == 0 {
            self.run_step(&format!("ifconfig {} create", BRIDGE)).await?;
            self.run_step(&format!("ifconfig {} addm {} addm {}", BRIDGE, self.uplink, tap))
                .await?;
        } else {
            self.run_step(&format!("ifconfig {} addm {}", BRIDGE, tap)).await?;
        }
        self.run_step(&format!("ifconfig {} up", BRIDGE)).await?;

        let launch = self.launch_command(config, index);
        self.runner.spawn_detached(&launch).await?;

        info!(tap = %tap, console = %format!("/dev/nmdm{}A", index), "bhyve VM launched");
        Ok(())
    }

    async fn get_instances(&self, _ctx: &Context) -> Result<Vec<CloudInstance>> {
        let output = match self.runner.run("ls /dev/vmm").await {
            Ok(output) => output,
            // No VM has been created since the vmm module was loaded.
            Err(ProviderError::CommandFailed { output, .. }) if output.contains("No such file") => {
                String::new()
            }
            Err(e) => return Err(e),
        };

        Ok(output
            .lines()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(|name| CloudInstance {
                id: name.to_string(),
                name: name.to_string(),
                status: "running".to_string(),
                ..Default::default()
            })
            .collect())
    }

    #[instrument(skip(self, _ctx))]
    async fn delete_instance(&self, _ctx: &Context, name: &str) -> Result<()> {
        let name = Self::vm_name(name)?;
        self.run_step(&format!("bhyvectl --destroy --vm={}", name)).await?;
        info!("bhyve VM destroyed");
        Ok(())
    }

    async fn start_instance(&self, _ctx: &Context, _name: &str) -> Result<()> {
        Err(ProviderError::unsupported(BACKEND, "start instance"))
    }

    #[instrument(skip(self, _ctx))]
    async fn stop_instance(&self, _ctx: &Context, name: &str) -> Result<()> {
        let name = Self::vm_name(name)?;
        self.run_step(&format!("bhyvectl --force-poweroff --vm={}", name)).await?;
        Ok(())
    }

    #[instrument(skip(self, _ctx))]
    async fn reset_instance(&self, _ctx: &Context, name: &str) -> Result<()> {
        let name = Self::vm_name(name)?;
        self.run_step(&format!("bhyvectl --force-reset --vm={}", name)).await?;
        Ok(())
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

    // =========================================================================
    // Volumes
    // =========================================================================

    async fn create_volume(
        &self,
        _ctx: &Context,
        _name: &str,
        _data: Option<&Path>,
        _size: &str,
        _provider: &str,
    ) -> Result<NanosVolume> {
        Err(ProviderError::unsupported(BACKEND, "create volume"))
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::testing::RecordingRunner;
    use tempfile::TempDir;

    fn context(home: &Path) -> Context {
        context_for_image(home, "web.img")
    }

    fn context_for_image(home: &Path, image: &str) -> Context {
        let mut config = Config::with_home(home);
        config.cloud_config.image_name = image.to_string();
        config.run_config.instance_name = "web".to_string();
        config.run_config.log_dir = home.to_path_buf();
        Context::new(config)
    }

    #[tokio::test]
    async fn test_first_instance_creates_bridge() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        let bhyve = Bhyve::with_runner(runner.clone());

        bhyve.create_instance(&context(dir.path())).await.unwrap();

        assert_eq!(
            runner.commands(),
            vec![
                "ls /dev/vmm",
                "ifconfig tap0 create",
                "sysctl net.link.tap.up_on_open=1",
                "ifconfig bridge0 create",
                "ifconfig bridge0 addm em0 addm tap0",
                "ifconfig bridge0 up",
            ]
        );

        let detached = runner.detached();
        assert_eq!(detached.len(), 1);
        assert!(detached[0].starts_with("bhyve -AHP -s 0:0,hostbridge"));
        assert!(detached[0].contains(&format!(
            "virtio-blk,{}",
            dir.path().join("images").join("web.img").display()
        )));
        assert!(detached[0].contains("-l com1,/dev/nmdm0A web >> "));
        assert!(detached[0].contains(&format!("{}", dir.path().join("web.log").display())));
    }

    #[tokio::test]
    async fn test_launch_quotes_image_with_shell_metacharacters() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        let bhyve = Bhyve::with_runner(runner.clone());
        let ctx = context_for_image(dir.path(), "web.img; touch /tmp/vmfleet-injected #");

        bhyve.create_instance(&ctx).await.unwrap();

        let image = dir.path().join("images").join("web.img; touch /tmp/vmfleet-injected #");
        let detached = &runner.detached()[0];
        assert!(detached.contains(&format!("virtio-blk,'{}' -s 2:0", image.display())));
        assert!(detached.ends_with("2>&1"));
    }

    #[tokio::test]
    async fn test_launch_quotes_paths_with_spaces() {
        let dir = TempDir::new().unwrap();
        let home = dir.path().join("vm state");
        let runner = Arc::new(RecordingRunner::new());
        let bhyve = Bhyve::with_runner(runner.clone());

        bhyve.create_instance(&context(&home)).await.unwrap();

        let detached = &runner.detached()[0];
        let image = home.join("images").join("web.img");
        assert!(detached.contains(&format!("virtio-blk,'{}'", image.display())));
        assert!(detached.contains(&format!(">> '{}' 2>&1", home.join("web.log").display())));
    }

    #[tokio::test]
    async fn test_later_instances_join_existing_bridge() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(RecordingRunner::new().respond("ls /dev/vmm", "db\ncache\n"));
        let bhyve = Bhyve::with_runner(runner.clone());

        bhyve.create_instance(&context(dir.path())).await.unwrap();

        let commands = runner.commands();
        assert!(commands.contains(&"ifconfig tap2 create".to_string()));
        assert!(commands.contains(&"ifconfig bridge0 addm tap2".to_string()));
        assert!(!commands.contains(&"ifconfig bridge0 create".to_string()));
        assert!(runner.detached()[0].contains("-l com1,/dev/nmdm2A"));
    }

    #[tokio::test]
    async fn test_failed_step_aborts_create() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(RecordingRunner::new().fail(
            "ifconfig tap0 create",
            "exit status: 1",
            "ifconfig: SIOCIFCREATE2: File exists",
        ));
        let bhyve = Bhyve::with_runner(runner.clone());

        let err = bhyve.create_instance(&context(dir.path())).await.unwrap_err();
        assert!(err.to_string().contains("File exists"));
        assert_eq!(runner.commands().len(), 2);
        assert!(runner.detached().is_empty());
    }

    #[tokio::test]
    async fn test_get_instances_lists_vmm_devices() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(RecordingRunner::new().respond("ls /dev/vmm", "web\n\n  db  \n"));
        let bhyve = Bhyve::with_runner(runner);

        let names: Vec<String> = bhyve
            .get_instances(&context(dir.path()))
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.name)
            .collect();
        assert_eq!(names, vec!["web", "db"]);
    }

    #[tokio::test]
    async fn test_missing_vmm_dir_means_no_instances() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(RecordingRunner::new().fail(
            "ls /dev/vmm",
            "exit status: 1",
            "ls: /dev/vmm: No such file or directory",
        ));
        let bhyve = Bhyve::with_runner(runner);

        assert!(bhyve.get_instances(&context(dir.path())).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_surfaces_command_output() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(RecordingRunner::new().fail(
            "bhyvectl",
            "exit status: 1",
            "vm_open: web could not be opened",
        ));
        let bhyve = Bhyve::with_runner(runner.clone());

        let err = bhyve
            .delete_instance(&context(dir.path()), "web")
            .await
            .unwrap_err();

        assert_eq!(runner.commands(), vec!["bhyvectl --destroy --vm=web"]);
        match err {
            ProviderError::CommandFailed { output, .. } => {
                assert!(output.contains("could not be opened"))
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stop_and_reset_tolerate_command_output() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(RecordingRunner::new().respond("bhyvectl", "vm web: powered off\n"));
        let bhyve = Bhyve::with_runner(runner.clone());
        let ctx = context(dir.path());

        bhyve.stop_instance(&ctx, "web").await.unwrap();
        bhyve.reset_instance(&ctx, "web").await.unwrap();

        assert_eq!(
            runner.commands(),
            vec!["bhyvectl --force-poweroff --vm=web", "bhyvectl --force-reset --vm=web"]
        );
    }

    #[tokio::test]
    async fn test_delete_rejects_shell_metacharacters() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        let bhyve = Bhyve::with_runner(runner.clone());

        let err = bhyve
            .delete_instance(&context(dir.path()), "web; reboot")
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::InvalidConfig(_)));
        assert!(runner.commands().is_empty());
    }

    #[tokio::test]
    async fn test_missing_log_is_an_error() {
        let dir = TempDir::new().unwrap();
        let bhyve = Bhyve::with_runner(Arc::new(RecordingRunner::new()));

        let err = bhyve
            .get_instance_logs(&context(dir.path()), "web")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_reads_instance_log() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("web.log"), "booting\n").unwrap();
        let bhyve = Bhyve::with_runner(Arc::new(RecordingRunner::new()));

        let logs = bhyve
            .get_instance_logs(&context(dir.path()), "web")
            .await
            .unwrap();
        assert_eq!(logs, "booting\n");
    }

    #[tokio::test]
    async fn test_volumes_are_unsupported() {
        let dir = TempDir::new().unwrap();
        let bhyve = Bhyve::with_runner(Arc::new(RecordingRunner::new()));

        let err = bhyve.get_all_volumes(&context(dir.path())).await.unwrap_err();
        assert!(err.is_unsupported());

        let err = bhyve
            .resize_image(&context(dir.path()), "web.img", "2G")
            .await
            .unwrap_err();
        assert!(err.is_unsupported());
    }
}

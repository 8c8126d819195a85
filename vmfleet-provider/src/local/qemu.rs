//! QEMU process management for the local backend.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

use crate::error::{ProviderError, Result};
use crate::exec::run_program;

/// Everything needed to boot one local VM.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub name: String,
    pub image: PathBuf,
    pub memory: String,
    /// Guest ports forwarded from the same host port (user networking only)
    pub ports: Vec<u16>,
    /// Local TCP port the QMP monitor listens on
    pub mgmt_port: u16,
    /// File receiving the serial console
    pub log: PathBuf,
    pub accel: bool,
    /// Attach to a host tap device instead of user networking
    pub bridged: bool,
    pub mac: String,
}

/// Starts and stops VM processes.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Boot the VM in the background and return its pid.
    async fn launch(&self, spec: &LaunchSpec, pid_file: &Path) -> Result<u32>;

    /// Whether process `pid` still exists.
    fn is_running(&self, pid: u32) -> bool;

    /// Ask process `pid` to exit.
    fn terminate(&self, pid: u32) -> Result<()>;
}

/// [`Hypervisor`] running `qemu-system-x86_64` daemonized.
#[derive(Debug, Clone)]
pub struct Qemu {
    program: String,
}

impl Qemu {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Command-line arguments for `spec`.
    pub fn args(&self, spec: &LaunchSpec, pid_file: &Path) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-machine".into(),
            "q35".into(),
            "-m".into(),
            spec.memory.clone(),
            "-drive".into(),
            format!("file={},format=raw,if=none,id=hd0", spec.image.display()),
            "-device".into(),
            "virtio-blk,drive=hd0".into(),
            "-device".into(),
            "virtio-scsi-pci,id=scsi0".into(),
        ];

        if spec.bridged {
            args.push("-netdev".into());
            args.push("tap,id=n0,ifname=tap0,script=no,downscript=no".into());
        } else {
            let forwards: String = spec
                .ports
                .iter()
                .map(|p| format!(",hostfwd=tcp::{}-:{}", p, p))
                .collect();
            args.push("-netdev".into());
            args.push(format!("user,id=n0{}", forwards));
        }

        let mut nic = "virtio-net,netdev=n0".to_string();
        if !spec.mac.is_empty() {
            nic.push_str(&format!(",mac={}", spec.mac));
        }
        args.push("-device".into());
        args.push(nic);

        args.extend([
            "-display".into(),
            "none".into(),
            "-serial".into(),
            format!("file:{}", spec.log.display()),
            "-no-reboot".into(),
            "-qmp".into(),
            format!("tcp:localhost:{},server,nowait", spec.mgmt_port),
            "-daemonize".into(),
            "-pidfile".into(),
            pid_file.display().to_string(),
        ]);

        if spec.accel && Path::new("/dev/kvm").exists() {
            args.extend(["-enable-kvm".into(), "-cpu".into(), "host".into()]);
        }

        args
    }
}

impl Default for Qemu {
    fn default() -> Self {
        Self::new("qemu-system-x86_64")
    }
}

#[async_trait]
impl Hypervisor for Qemu {
    #[instrument(skip(self, spec, pid_file), fields(vm = %spec.name))]
    async fn launch(&self, spec: &LaunchSpec, pid_file: &Path) -> Result<u32> {
        let args = self.args(spec, pid_file);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        run_program(&self.program, &args).await?;

        let content = tokio::fs::read_to_string(pid_file)
            .await
            .map_err(|e| ProviderError::io(pid_file, e))?;
        let _ = tokio::fs::remove_file(pid_file).await;

        let pid = content.trim().parse::<u32>().map_err(|_| {
            ProviderError::InvalidConfig(format!("invalid pid file content {:?}", content.trim()))
        })?;
        info!(pid, mgmt_port = spec.mgmt_port, "QEMU started");
        Ok(pid)
    }

    #[cfg(unix)]
    fn is_running(&self, pid: u32) -> bool {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        match kill(Pid::from_raw(pid as i32), None) {
            Ok(()) => true,
            // Exists but owned by someone else.
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    #[cfg(not(unix))]
    fn is_running(&self, _pid: u32) -> bool {
        true
    }

    #[cfg(unix)]
    fn terminate(&self, pid: u32) -> Result<()> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        debug!(pid, "Sending SIGTERM");
        kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(|e| ProviderError::Spawn {
            command: format!("kill {}", pid),
            source: std::io::Error::from(e),
        })
    }

    #[cfg(not(unix))]
    fn terminate(&self, _pid: u32) -> Result<()> {
        Err(ProviderError::unsupported("onprem", "terminate process"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> LaunchSpec {
        LaunchSpec {
            name: "web".to_string(),
            image: PathBuf::from("/images/web.img"),
            memory: "1G".to_string(),
            ports: vec![80, 443],
            mgmt_port: 40123,
            log: PathBuf::from("/tmp/web.log"),
            accel: false,
            bridged: false,
            mac: String::new(),
        }
    }

    #[test]
    fn test_args_forward_ports_and_enable_qmp() {
        let args = Qemu::default().args(&spec(), Path::new("/run/web.pid"));
        let joined = args.join(" ");

        assert!(joined.contains("-netdev user,id=n0,hostfwd=tcp::80-:80,hostfwd=tcp::443-:443"));
        assert!(joined.contains("-qmp tcp:localhost:40123,server,nowait"));
        assert!(joined.contains("-serial file:/tmp/web.log"));
        assert!(joined.contains("-pidfile /run/web.pid"));
        assert!(!joined.contains("-enable-kvm"));
    }

    #[test]
    fn test_bridged_uses_tap() {
        let mut spec = spec();
        spec.bridged = true;
        spec.mac = "52:54:00:12:34:56".to_string();

        let joined = Qemu::default().args(&spec, Path::new("/run/web.pid")).join(" ");
        assert!(joined.contains("-netdev tap,id=n0"));
        assert!(joined.contains("virtio-net,netdev=n0,mac=52:54:00:12:34:56"));
        assert!(!joined.contains("hostfwd"));
    }

    #[cfg(unix)]
    #[test]
    fn test_current_process_is_running() {
        assert!(Qemu::default().is_running(std::process::id()));
    }
}

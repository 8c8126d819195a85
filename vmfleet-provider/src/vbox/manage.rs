//! VirtualBox automation through `VBoxManage`.

use async_trait::async_trait;
use std::fmt;

use crate::error::{ProviderError, Result};
use crate::exec::run_program;

pub const VBOXMANAGE: &str = "VBoxManage";

/// A registered VirtualBox machine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Machine {
    pub name: String,
    pub uuid: String,
    /// `VMState` as reported by VirtualBox, e.g. `running` or `poweroff`
    pub state: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysBus {
    Ide,
    Sata,
}

impl fmt::Display for SysBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ide => "ide",
            Self::Sata => "sata",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chipset {
    Piix3,
    Piix4,
    IntelAhci,
}

impl fmt::Display for Chipset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Piix3 => "PIIX3",
            Self::Piix4 => "PIIX4",
            Self::IntelAhci => "IntelAhci",
        })
    }
}

/// Storage controller definition for `storagectl --add`.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageController {
    pub bus: SysBus,
    pub ports: u32,
    pub chipset: Chipset,
    pub host_io_cache: bool,
    pub bootable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveType {
    Hdd,
    Dvd,
}

impl fmt::Display for DriveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Hdd => "hdd",
            Self::Dvd => "dvddrive",
        })
    }
}

/// Medium attachment for `storageattach`.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageMedium {
    pub port: u32,
    pub device: u32,
    pub drive_type: DriveType,
    pub medium: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NicNetwork {
    Nat,
    Bridged,
}

impl fmt::Display for NicNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Nat => "nat",
            Self::Bridged => "bridged",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NicHardware {
    VirtIo,
    E1000,
}

impl fmt::Display for NicHardware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::VirtIo => "virtio",
            Self::E1000 => "82540EM",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Nic {
    pub network: NicNetwork,
    pub hardware: NicHardware,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PfProto {
    Tcp,
    Udp,
}

impl fmt::Display for PfProto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        })
    }
}

/// NAT port-forward rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortForward {
    pub proto: PfProto,
    pub host_port: u16,
    pub guest_port: u16,
}

/// VirtualBox automation surface used by the provider.
#[async_trait]
pub trait VirtualBox: Send + Sync {
    async fn clone_hd(&self, source: &str, target: &str) -> Result<()>;

    /// Create and register a machine under `base_folder`.
    async fn create_machine(&self, name: &str, base_folder: &str) -> Result<Machine>;

    async fn add_storage_ctl(&self, vm: &str, name: &str, ctl: &StorageController) -> Result<()>;

    async fn attach_storage(&self, vm: &str, ctl: &str, medium: &StorageMedium) -> Result<()>;

    async fn set_memory(&self, vm: &str, mib: u64) -> Result<()>;

    async fn set_nic(&self, vm: &str, slot: u8, nic: &Nic) -> Result<()>;

    async fn add_nat_pf(&self, vm: &str, slot: u8, rule_name: &str, rule: &PortForward) -> Result<()>;

    async fn set_guest_property(&self, vm: &str, key: &str, value: &str) -> Result<()>;

    /// Read a guest property; `None` when it was never set.
    async fn get_guest_property(&self, vm: &str, key: &str) -> Result<Option<String>>;

    /// Power the machine on headless.
    async fn start(&self, vm: &str) -> Result<()>;

    async fn power_off(&self, vm: &str) -> Result<()>;

    async fn reset(&self, vm: &str) -> Result<()>;

    async fn list_machines(&self) -> Result<Vec<Machine>>;

    /// Look a machine up by name or UUID.
    async fn get_machine(&self, name: &str) -> Result<Machine>;

    /// Unregister the machine and delete its files.
    async fn delete_machine(&self, vm: &str) -> Result<()>;

    /// Unregister a disk medium and delete the file.
    async fn close_medium(&self, path: &str) -> Result<()>;
}

/// [`VirtualBox`] implementation invoking `VBoxManage`.
#[derive(Debug, Clone)]
pub struct VBoxManage {
    program: String,
}

impl VBoxManage {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn manage(&self, args: &[&str]) -> Result<String> {
        run_program(&self.program, args).await
    }
}

impl Default for VBoxManage {
    fn default() -> Self {
        Self::new(VBOXMANAGE)
    }
}

fn on_off(flag: bool) -> &'static str {
    if flag {
        "on"
    } else {
        "off"
    }
}

/// Parse `VBoxManage list vms` output: `"name" {uuid}` per line.
pub fn parse_list_vms(output: &str) -> Vec<(String, String)> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let rest = line.strip_prefix('"')?;
            let (name, rest) = rest.rsplit_once('"')?;
            let uuid = rest.trim().strip_prefix('{')?.strip_suffix('}')?;
            Some((name.to_string(), uuid.to_string()))
        })
        .collect()
}

/// Parse `VBoxManage showvminfo --machinereadable` output.
pub fn parse_machine_info(output: &str) -> Machine {
    let mut machine = Machine::default();
    for line in output.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"').to_string();
        match key.trim() {
            "name" => machine.name = value,
            "UUID" => machine.uuid = value,
            "VMState" => machine.state = value,
            _ => {}
        }
    }
    machine
}

/// Parse `VBoxManage guestproperty get` output: `Value: <value>`, or
/// `No value set!` for a missing property.
pub fn parse_guest_property(output: &str) -> Option<String> {
    output
        .lines()
        .find_map(|line| line.trim().strip_prefix("Value:"))
        .map(|value| value.trim().to_string())
}

#[async_trait]
impl VirtualBox for VBoxManage {
    async fn clone_hd(&self, source: &str, target: &str) -> Result<()> {
        self.manage(&["clonemedium", "disk", source, target]).await?;
        Ok(())
    }

    async fn create_machine(&self, name: &str, base_folder: &str) -> Result<Machine> {
        self.manage(&["createvm", "--name", name, "--basefolder", base_folder, "--register"])
            .await?;
        self.get_machine(name).await
    }

    async fn add_storage_ctl(&self, vm: &str, name: &str, ctl: &StorageController) -> Result<()> {
        let bus = ctl.bus.to_string();
        let ports = ctl.ports.to_string();
        let chipset = ctl.chipset.to_string();
        self.manage(&[
            "storagectl",
            vm,
            "--name",
            name,
            "--add",
            &bus,
            "--portcount",
            &ports,
            "--controller",
            &chipset,
            "--hostiocache",
            on_off(ctl.host_io_cache),
            "--bootable",
            on_off(ctl.bootable),
        ])
        .await?;
        Ok(())
    }

    async fn attach_storage(&self, vm: &str, ctl: &str, medium: &StorageMedium) -> Result<()> {
        let port = medium.port.to_string();
        let device = medium.device.to_string();
        let drive = medium.drive_type.to_string();
        self.manage(&[
            "storageattach",
            vm,
            "--storagectl",
            ctl,
            "--port",
            &port,
            "--device",
            &device,
            "--type",
            &drive,
            "--medium",
            &medium.medium,
        ])
        .await?;
        Ok(())
    }

    async fn set_memory(&self, vm: &str, mib: u64) -> Result<()> {
        let mib = mib.to_string();
        self.manage(&["modifyvm", vm, "--memory", &mib]).await?;
        Ok(())
    }

    async fn set_nic(&self, vm: &str, slot: u8, nic: &Nic) -> Result<()> {
        let nic_flag = format!("--nic{}", slot);
        let type_flag = format!("--nictype{}", slot);
        let network = nic.network.to_string();
        let hardware = nic.hardware.to_string();
        self.manage(&["modifyvm", vm, &nic_flag, &network, &type_flag, &hardware])
            .await?;
        Ok(())
    }

    async fn add_nat_pf(&self, vm: &str, slot: u8, rule_name: &str, rule: &PortForward) -> Result<()> {
        let flag = format!("--natpf{}", slot);
        let spec = format!(
            "{},{},,{},,{}",
            rule_name, rule.proto, rule.host_port, rule.guest_port
        );
        self.manage(&["modifyvm", vm, &flag, &spec]).await?;
        Ok(())
    }

    async fn set_guest_property(&self, vm: &str, key: &str, value: &str) -> Result<()> {
        self.manage(&["guestproperty", "set", vm, key, value]).await?;
        Ok(())
    }

    async fn get_guest_property(&self, vm: &str, key: &str) -> Result<Option<String>> {
        let output = self.manage(&["guestproperty", "get", vm, key]).await?;
        Ok(parse_guest_property(&output))
    }

    async fn start(&self, vm: &str) -> Result<()> {
        self.manage(&["startvm", vm, "--type", "headless"]).await?;
        Ok(())
    }

    async fn power_off(&self, vm: &str) -> Result<()> {
        self.manage(&["controlvm", vm, "poweroff"]).await?;
        Ok(())
    }

    async fn reset(&self, vm: &str) -> Result<()> {
        self.manage(&["controlvm", vm, "reset"]).await?;
        Ok(())
    }

    async fn list_machines(&self) -> Result<Vec<Machine>> {
        let output = self.manage(&["list", "vms"]).await?;
        let mut machines = Vec::new();
        for (_, uuid) in parse_list_vms(&output) {
            // Machines can disappear between the two calls.
            match self.get_machine(&uuid).await {
                Ok(machine) => machines.push(machine),
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(machines)
    }

    async fn get_machine(&self, name: &str) -> Result<Machine> {
        match self.manage(&["showvminfo", name, "--machinereadable"]).await {
            Ok(output) => Ok(parse_machine_info(&output)),
            Err(ProviderError::CommandFailed { output, .. })
                if output.contains("Could not find a registered machine") =>
            {
                Err(ProviderError::not_found("machine", name))
            }
            Err(e) => Err(e),
        }
    }

    async fn delete_machine(&self, vm: &str) -> Result<()> {
        self.manage(&["unregistervm", vm, "--delete"]).await?;
        Ok(())
    }

    async fn close_medium(&self, path: &str) -> Result<()> {
        self.manage(&["closemedium", "disk", path, "--delete"]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list_vms() {
        let output = "\"web\" {8a1d6a40-0b5e-4e8e-9c42-4d3c1f0e7a11}\n\
                      \"my \"quoted\" vm\" {0c9b1a55-1111-2222-3333-444455556666}\n\
                      garbage\n";
        assert_eq!(
            parse_list_vms(output),
            vec![
                (
                    "web".to_string(),
                    "8a1d6a40-0b5e-4e8e-9c42-4d3c1f0e7a11".to_string()
                ),
                (
                    "my \"quoted\" vm".to_string(),
                    "0c9b1a55-1111-2222-3333-444455556666".to_string()
                ),
            ]
        );
    }

    #[test]
    fn test_parse_guest_property() {
        assert_eq!(parse_guest_property("Value: nginx\n"), Some("nginx".to_string()));
        assert_eq!(parse_guest_property("Value: 80,443"), Some("80,443".to_string()));
        assert_eq!(parse_guest_property("No value set!\n"), None);
    }

    #[test]
    fn test_parse_machine_info() {
        let output = "name=\"web\"\n\
                      groups=\"/\"\n\
                      UUID=\"8a1d6a40-0b5e-4e8e-9c42-4d3c1f0e7a11\"\n\
                      VMState=\"poweroff\"\n\
                      VMStateChangeTime=\"2024-01-01T00:00:00.000000000\"\n";
        assert_eq!(
            parse_machine_info(output),
            Machine {
                name: "web".to_string(),
                uuid: "8a1d6a40-0b5e-4e8e-9c42-4d3c1f0e7a11".to_string(),
                state: "poweroff".to_string(),
            }
        );
    }
}

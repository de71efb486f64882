//! Execution strategies. Each adapter turns an instance spec into data
//! (commands, liveness checks, provisioning steps); running them is the
//! supervisor's and provisioner's job, so adapters never touch the host.

mod container;
mod rootfs;
mod vm;

pub use container::ContainerAdapter;
pub use rootfs::RootEmulationAdapter;
pub use vm::VmAdapter;

use crate::config::{Config, RootWrapper, SeedBuilder};
use crate::error::CorralError;
use crate::host::CommandLine;
use crate::instance::{Backend, InstancePaths, InstanceSpec};
use std::path::{Path, PathBuf};

pub const KVM_DEVICE: &str = "/dev/kvm";

/// Host tool names and VM defaults, resolved once from config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toolchain {
    pub qemu_system: String,
    pub qemu_img: String,
    pub container_engine: String,
    pub seed_builder: SeedBuilder,
    pub root_wrapper: RootWrapper,
    pub openssl: String,
    pub machine: String,
    pub display: String,
    pub cloud_init: bool,
    pub guest_ssh_port: u16,
    pub kvm: bool,
}

impl Toolchain {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            qemu_system: cfg.tools.qemu_system.clone(),
            qemu_img: cfg.tools.qemu_img.clone(),
            container_engine: cfg.tools.container_engine.clone(),
            seed_builder: cfg.tools.seed_builder,
            root_wrapper: cfg.tools.root_wrapper,
            openssl: cfg.tools.openssl.clone(),
            machine: cfg.vm.machine.clone(),
            display: cfg.vm.display.clone(),
            cloud_init: cfg.vm.cloud_init,
            guest_ssh_port: cfg.vm.guest_ssh_port,
            kvm: Path::new(KVM_DEVICE).exists(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    /// Blocks the caller until the guest exits.
    Foreground,
    /// Detached child; its pid is recorded in the pid file.
    Background,
    /// The engine daemon owns the process; the launch command returns at once.
    EngineManaged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub command: CommandLine,
    pub mode: LaunchMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Liveness {
    /// A live process whose argv contains this exact token.
    ProcessMarker(String),
    /// Ask the engine; exit 0 with stdout `true` means running.
    EngineQuery(CommandLine),
    /// Only the recorded pid can be checked.
    PidFileOnly,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactCheck {
    PathExists(PathBuf),
    CommandSucceeds(CommandLine),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionStep {
    Directory(PathBuf),
    Fetch { url: String, dest: PathBuf },
    Command { check: ArtifactCheck, command: CommandLine },
    Extract { archive: PathBuf, dest: PathBuf },
    Seed,
}

pub trait BackendAdapter {
    fn backend(&self) -> Backend;

    fn launch_plan(&self, spec: &InstanceSpec, paths: &InstancePaths) -> LaunchPlan;

    /// Native stop command; `None` means signal the process.
    fn stop_command(&self, _spec: &InstanceSpec) -> Option<CommandLine> {
        None
    }

    fn force_stop_command(&self, _spec: &InstanceSpec) -> Option<CommandLine> {
        None
    }

    fn liveness(&self, spec: &InstanceSpec, paths: &InstancePaths) -> Liveness;

    /// Artifacts the instance needs before it can launch, in order.
    fn provision_steps(&self, spec: &InstanceSpec, paths: &InstancePaths) -> Vec<ProvisionStep>;

    fn resize_command(
        &self,
        spec: &InstanceSpec,
        paths: &InstancePaths,
        size: &str,
    ) -> Result<CommandLine, CorralError>;

    /// Engine-side leftovers to remove on delete.
    fn cleanup_command(&self, _spec: &InstanceSpec) -> Option<CommandLine> {
        None
    }

    fn uses_seed(&self) -> bool {
        false
    }
}

pub fn adapter_for(backend: Backend, toolchain: &Toolchain) -> Box<dyn BackendAdapter> {
    match backend {
        Backend::Vm => Box::new(VmAdapter::new(toolchain.clone())),
        Backend::Container => Box::new(ContainerAdapter::new(toolchain.clone())),
        Backend::RootEmulation => Box::new(RootEmulationAdapter::new(toolchain.clone())),
    }
}

#[cfg(test)]
pub(crate) fn test_toolchain() -> Toolchain {
    Toolchain {
        qemu_system: "qemu-system-x86_64".to_string(),
        qemu_img: "qemu-img".to_string(),
        container_engine: "docker".to_string(),
        seed_builder: SeedBuilder::CloudLocalds,
        root_wrapper: RootWrapper::Proot,
        openssl: "openssl".to_string(),
        machine: "q35".to_string(),
        display: "gtk".to_string(),
        cloud_init: true,
        guest_ssh_port: 22,
        kvm: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adapter_matches_requested_backend() {
        let tools = test_toolchain();
        for backend in [Backend::Vm, Backend::Container, Backend::RootEmulation] {
            assert_eq!(adapter_for(backend, &tools).backend(), backend);
        }
    }

    #[test]
    fn toolchain_copies_configured_tools() {
        let mut cfg = Config::default();
        cfg.tools.container_engine = "podman".to_string();
        cfg.vm.guest_ssh_port = 2022;
        let tools = Toolchain::from_config(&cfg);
        assert_eq!(tools.container_engine, "podman");
        assert_eq!(tools.guest_ssh_port, 2022);
        assert_eq!(tools.kvm, Path::new(KVM_DEVICE).exists());
    }
}

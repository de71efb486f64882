use super::{
    ArtifactCheck, BackendAdapter, LaunchMode, LaunchPlan, Liveness, ProvisionStep, Toolchain,
};
use crate::error::CorralError;
use crate::host::CommandLine;
use crate::instance::{Backend, InstancePaths, InstanceSpec};

pub struct VmAdapter {
    tools: Toolchain,
}

impl VmAdapter {
    pub fn new(tools: Toolchain) -> Self {
        Self { tools }
    }

    pub fn marker(name: &str) -> String {
        format!("corral-{name}")
    }

    /// One user-mode NIC per rule so every hostfwd gets its own netdev id;
    /// `net0` carries the primary ssh forward.
    fn network_args(&self, spec: &InstanceSpec) -> Vec<String> {
        let mut rules = vec![(spec.network.ssh_port, self.tools.guest_ssh_port)];
        rules.extend(spec.network.forwards.iter().map(|rule| (rule.host, rule.guest)));
        let mut args = Vec::with_capacity(rules.len() * 4);
        for (idx, (host, guest)) in rules.into_iter().enumerate() {
            args.push("-netdev".to_string());
            args.push(format!("user,id=net{idx},hostfwd=tcp::{host}-:{guest}"));
            args.push("-device".to_string());
            args.push(format!("virtio-net-pci,netdev=net{idx}"));
        }
        args
    }
}

impl BackendAdapter for VmAdapter {
    fn backend(&self) -> Backend {
        Backend::Vm
    }

    fn launch_plan(&self, spec: &InstanceSpec, paths: &InstancePaths) -> LaunchPlan {
        let mut command = CommandLine::new(&self.tools.qemu_system)
            .arg("-name")
            .arg(Self::marker(&spec.name))
            .arg("-machine")
            .arg(self.tools.machine.as_str());
        command = if self.tools.kvm {
            command.args(["-accel", "kvm", "-cpu", "host"])
        } else {
            command.args(["-cpu", "max"])
        };
        command = command
            .arg("-smp")
            .arg(spec.resources.cpus.to_string())
            .arg("-m")
            .arg(spec.resources.memory_mb.to_string())
            .arg("-drive")
            .arg(format!(
                "file={},if=virtio,format=qcow2",
                paths.disk_image.display()
            ));
        if self.uses_seed() {
            command = command.arg("-drive").arg(format!(
                "file={},if=virtio,format=raw,readonly=on",
                paths.seed_image.display()
            ));
        }
        command = command.args(self.network_args(spec));
        if spec.display {
            LaunchPlan {
                command: command.arg("-display").arg(self.tools.display.as_str()),
                mode: LaunchMode::Background,
            }
        } else {
            LaunchPlan {
                command: command.arg("-nographic"),
                mode: LaunchMode::Foreground,
            }
        }
    }

    fn liveness(&self, spec: &InstanceSpec, _paths: &InstancePaths) -> Liveness {
        Liveness::ProcessMarker(Self::marker(&spec.name))
    }

    fn provision_steps(&self, spec: &InstanceSpec, paths: &InstancePaths) -> Vec<ProvisionStep> {
        let base = paths.cached_source(&spec.os.source);
        let create_disk = CommandLine::new(&self.tools.qemu_img)
            .args(["create", "-f", "qcow2", "-F", "qcow2", "-b"])
            .arg(base.display().to_string())
            .arg(paths.disk_image.display().to_string())
            .arg(spec.resources.disk_size.clone());
        let mut steps = vec![
            ProvisionStep::Fetch {
                url: spec.os.source.clone(),
                dest: base,
            },
            ProvisionStep::Command {
                check: ArtifactCheck::PathExists(paths.disk_image.clone()),
                command: create_disk,
            },
        ];
        if self.uses_seed() {
            steps.push(ProvisionStep::Seed);
        }
        steps
    }

    fn resize_command(
        &self,
        _spec: &InstanceSpec,
        paths: &InstancePaths,
        size: &str,
    ) -> Result<CommandLine, CorralError> {
        Ok(CommandLine::new(&self.tools.qemu_img)
            .arg("resize")
            .arg(paths.disk_image.display().to_string())
            .arg(size))
    }

    fn uses_seed(&self) -> bool {
        self.tools.cloud_init
    }
}

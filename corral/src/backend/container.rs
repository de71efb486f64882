use super::{
    ArtifactCheck, BackendAdapter, LaunchMode, LaunchPlan, Liveness, ProvisionStep, Toolchain,
};
use crate::error::CorralError;
use crate::host::CommandLine;
use crate::instance::{Backend, InstancePaths, InstanceSpec};

pub const CONTAINER_DATA_MOUNT: &str = "/data";

pub struct ContainerAdapter {
    tools: Toolchain,
}

impl ContainerAdapter {
    pub fn new(tools: Toolchain) -> Self {
        Self { tools }
    }

    fn engine(&self) -> CommandLine {
        CommandLine::new(self.tools.container_engine.as_str())
    }
}

impl BackendAdapter for ContainerAdapter {
    fn backend(&self) -> Backend {
        Backend::Container
    }

    fn launch_plan(&self, spec: &InstanceSpec, paths: &InstancePaths) -> LaunchPlan {
        let mut command = self
            .engine()
            .args(["run", "--rm", "--privileged"])
            .arg("--name")
            .arg(spec.name.as_str())
            .arg("--hostname")
            .arg(spec.name.as_str())
            .arg("--memory")
            .arg(format!("{}m", spec.resources.memory_mb))
            .arg("--cpus")
            .arg(spec.resources.cpus.to_string())
            .arg("-p")
            .arg(format!(
                "{}:{}",
                spec.network.ssh_port, self.tools.guest_ssh_port
            ));
        for rule in &spec.network.forwards {
            command = command.arg("-p").arg(rule.to_string());
        }
        command = command.arg("-v").arg(format!(
            "{}:{CONTAINER_DATA_MOUNT}",
            paths.data_dir.display()
        ));
        if spec.display {
            LaunchPlan {
                command: command
                    .arg("-d")
                    .arg(spec.os.source.as_str())
                    .args(["sleep", "infinity"]),
                mode: LaunchMode::EngineManaged,
            }
        } else {
            LaunchPlan {
                command: command
                    .arg("-it")
                    .arg(spec.os.source.as_str())
                    .args(["/bin/bash", "-l"]),
                mode: LaunchMode::Foreground,
            }
        }
    }

    fn stop_command(&self, spec: &InstanceSpec) -> Option<CommandLine> {
        Some(self.engine().arg("stop").arg(spec.name.as_str()))
    }

    fn force_stop_command(&self, spec: &InstanceSpec) -> Option<CommandLine> {
        Some(self.engine().arg("kill").arg(spec.name.as_str()))
    }

    fn liveness(&self, spec: &InstanceSpec, _paths: &InstancePaths) -> Liveness {
        Liveness::EngineQuery(
            self.engine()
                .args(["inspect", "--format", "{{.State.Running}}"])
                .arg(spec.name.as_str()),
        )
    }

    fn provision_steps(&self, spec: &InstanceSpec, paths: &InstancePaths) -> Vec<ProvisionStep> {
        vec![
            ProvisionStep::Directory(paths.data_dir.clone()),
            ProvisionStep::Command {
                check: ArtifactCheck::CommandSucceeds(
                    self.engine()
                        .args(["image", "inspect"])
                        .arg(spec.os.source.as_str()),
                ),
                command: self.engine().arg("pull").arg(spec.os.source.as_str()),
            },
        ]
    }

    fn resize_command(
        &self,
        spec: &InstanceSpec,
        _paths: &InstancePaths,
        _size: &str,
    ) -> Result<CommandLine, CorralError> {
        Err(CorralError::unsupported(format!(
            "instance '{}' uses the container backend, which has no resizable disk",
            spec.name
        )))
    }

    fn cleanup_command(&self, spec: &InstanceSpec) -> Option<CommandLine> {
        Some(self.engine().args(["rm", "-f"]).arg(spec.name.as_str()))
    }
}

use super::{BackendAdapter, LaunchMode, LaunchPlan, Liveness, ProvisionStep, Toolchain};
use crate::config::RootWrapper;
use crate::error::CorralError;
use crate::host::CommandLine;
use crate::instance::{Backend, InstancePaths, InstanceSpec};

const PROOT_BINDS: [&str; 4] = ["/dev", "/proc", "/sys", "/tmp"];

/// User-space root emulation: proot with the extracted tree as `/`, or
/// fakeroot around a login shell when no root change is wanted.
pub struct RootEmulationAdapter {
    tools: Toolchain,
}

impl RootEmulationAdapter {
    pub fn new(tools: Toolchain) -> Self {
        Self { tools }
    }

    /// The wrapper recorded at create time wins over the current config.
    fn wrapper(&self, spec: &InstanceSpec) -> RootWrapper {
        spec.root_wrapper.unwrap_or(self.tools.root_wrapper)
    }
}

impl BackendAdapter for RootEmulationAdapter {
    fn backend(&self) -> Backend {
        Backend::RootEmulation
    }

    fn launch_plan(&self, spec: &InstanceSpec, paths: &InstancePaths) -> LaunchPlan {
        let command = match self.wrapper(spec) {
            RootWrapper::Proot => {
                let mut command = CommandLine::new("proot")
                    .arg("-0")
                    .arg("-r")
                    .arg(paths.rootfs_dir.display().to_string());
                for bind in PROOT_BINDS {
                    command = command.arg("-b").arg(bind);
                }
                command.args(["-w", "/root", "/bin/sh", "-l"])
            }
            RootWrapper::Fakeroot => CommandLine::new("fakeroot").args(["--", "/bin/sh", "-l"]),
        };
        LaunchPlan {
            command,
            mode: LaunchMode::Foreground,
        }
    }

    fn liveness(&self, spec: &InstanceSpec, paths: &InstancePaths) -> Liveness {
        match self.wrapper(spec) {
            RootWrapper::Proot => {
                Liveness::ProcessMarker(paths.rootfs_dir.display().to_string())
            }
            RootWrapper::Fakeroot => Liveness::PidFileOnly,
        }
    }

    fn provision_steps(&self, spec: &InstanceSpec, paths: &InstancePaths) -> Vec<ProvisionStep> {
        let mut steps = vec![ProvisionStep::Directory(paths.data_dir.clone())];
        if self.wrapper(spec) == RootWrapper::Proot && !spec.os.source.is_empty() {
            let archive = paths.cached_source(&spec.os.source);
            steps.push(ProvisionStep::Fetch {
                url: spec.os.source.clone(),
                dest: archive.clone(),
            });
            steps.push(ProvisionStep::Extract {
                archive,
                dest: paths.rootfs_dir.clone(),
            });
        }
        steps
    }

    fn resize_command(
        &self,
        spec: &InstanceSpec,
        _paths: &InstancePaths,
        _size: &str,
    ) -> Result<CommandLine, CorralError> {
        Err(CorralError::unsupported(format!(
            "instance '{}' uses the rootfs backend, which has no disk image to resize",
            spec.name
        )))
    }
}

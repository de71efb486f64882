use crate::backend::{ArtifactCheck, BackendAdapter, ProvisionStep, Toolchain};
use crate::error::CorralError;
use crate::host::{execute, CommandLine, Host};
use crate::instance::{InstancePaths, InstanceSpec};
use crate::seed::build_seed;
use std::fs;
use std::path::Path;

/// Runs the adapter's provisioning steps, skipping every step whose artifact
/// is already present. Returns a short label per step that actually ran.
pub fn provision<H: Host + ?Sized>(
    host: &H,
    tools: &Toolchain,
    adapter: &dyn BackendAdapter,
    spec: &InstanceSpec,
    paths: &InstancePaths,
) -> Result<Vec<String>, CorralError> {
    fs::create_dir_all(&paths.instance_dir)?;
    tracing::debug!(instance = %spec.name, backend = %adapter.backend(), "checking artifacts");
    let mut performed = Vec::new();
    for step in adapter.provision_steps(spec, paths) {
        if artifact_present(host, &step, paths) {
            continue;
        }
        let label = run_step(host, tools, spec, paths, &step)?;
        tracing::info!(instance = %spec.name, step = %label, "provisioned");
        performed.push(label);
    }
    Ok(performed)
}

fn artifact_present<H: Host + ?Sized>(host: &H, step: &ProvisionStep, paths: &InstancePaths) -> bool {
    match step {
        ProvisionStep::Directory(dir) => dir.is_dir(),
        ProvisionStep::Fetch { dest, .. } => dest.is_file(),
        ProvisionStep::Command { check, .. } => match check {
            ArtifactCheck::PathExists(path) => path.exists(),
            ArtifactCheck::CommandSucceeds(command) => host
                .run(command, None)
                .map(|output| output.success())
                .unwrap_or(false),
        },
        ProvisionStep::Extract { dest, .. } => dir_has_entries(dest),
        ProvisionStep::Seed => paths.seed_image.is_file(),
    }
}

fn dir_has_entries(dir: &Path) -> bool {
    fs::read_dir(dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

fn run_step<H: Host + ?Sized>(
    host: &H,
    tools: &Toolchain,
    spec: &InstanceSpec,
    paths: &InstancePaths,
    step: &ProvisionStep,
) -> Result<String, CorralError> {
    match step {
        ProvisionStep::Directory(dir) => {
            fs::create_dir_all(dir)?;
            Ok(format!("directory {}", dir.display()))
        }
        ProvisionStep::Fetch { url, dest } => {
            host.download(url, dest)?;
            Ok(format!("download {url}"))
        }
        ProvisionStep::Command { command, .. } => {
            execute(host, command, None)?;
            Ok(command.render())
        }
        ProvisionStep::Extract { archive, dest } => {
            fs::create_dir_all(dest)?;
            let command = extract_command(archive, dest);
            if let Err(err) = execute(host, &command, None) {
                let _ = fs::remove_dir_all(dest);
                return Err(err);
            }
            Ok(format!("extract {}", archive.display()))
        }
        ProvisionStep::Seed => {
            build_seed(host, tools, spec, paths)?;
            Ok("seed image".to_string())
        }
    }
}

pub fn extract_command(archive: &Path, dest: &Path) -> CommandLine {
    CommandLine::new("tar")
        .arg("-xf")
        .arg(archive.display().to_string())
        .arg("-C")
        .arg(dest.display().to_string())
        .arg("--no-same-owner")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{adapter_for, test_toolchain};
    use crate::host::fake::{Call, FakeHost};
    use crate::instance::{sample_spec, Backend};
    use tempfile::tempdir;

    #[test]
    fn vm_provisioning_downloads_creates_disk_and_seed() {
        let dir = tempdir().unwrap();
        let host = FakeHost::new();
        host.push_output("openssl", 0, "$6$hash", "");
        let tools = test_toolchain();
        let spec = sample_spec("web", Backend::Vm, 2222);
        let paths = InstancePaths::derive(dir.path(), "web");
        let adapter = adapter_for(Backend::Vm, &tools);

        let performed = provision(&host, &tools, adapter.as_ref(), &spec, &paths).unwrap();

        assert_eq!(performed.len(), 3);
        assert!(paths.disk_image.exists());
        assert!(paths.seed_image.exists());
        assert!(paths.cached_source(&spec.os.source).exists());
    }

    #[test]
    fn present_artifacts_are_not_rebuilt() {
        let dir = tempdir().unwrap();
        let host = FakeHost::new();
        host.push_output("openssl", 0, "$6$hash", "");
        let tools = test_toolchain();
        let spec = sample_spec("web", Backend::Vm, 2222);
        let paths = InstancePaths::derive(dir.path(), "web");
        let adapter = adapter_for(Backend::Vm, &tools);
        provision(&host, &tools, adapter.as_ref(), &spec, &paths).unwrap();
        let calls_after_first = host.calls().len();

        fs::remove_file(&paths.disk_image).unwrap();
        let performed = provision(&host, &tools, adapter.as_ref(), &spec, &paths).unwrap();

        assert_eq!(performed.len(), 1);
        assert!(performed[0].starts_with("qemu-img create"));
        assert_eq!(host.calls().len(), calls_after_first + 1);
    }

    #[test]
    fn download_failure_stops_provisioning() {
        let dir = tempdir().unwrap();
        let host = FakeHost::new();
        *host.fail_downloads.borrow_mut() = true;
        let tools = test_toolchain();
        let spec = sample_spec("web", Backend::Vm, 2222);
        let paths = InstancePaths::derive(dir.path(), "web");
        let adapter = adapter_for(Backend::Vm, &tools);

        let err = provision(&host, &tools, adapter.as_ref(), &spec, &paths).unwrap_err();

        assert_eq!(err.kind(), "backend");
        assert!(host.runs().is_empty());
        assert!(!paths.disk_image.exists());
    }

    #[test]
    fn container_image_pull_is_skipped_when_present() {
        let dir = tempdir().unwrap();
        let host = FakeHost::new();
        let tools = test_toolchain();
        let mut spec = sample_spec("box", Backend::Container, 2223);
        spec.os.source = "ubuntu:22.04".to_string();
        let paths = InstancePaths::derive(dir.path(), "box");
        let adapter = adapter_for(Backend::Container, &tools);

        let performed = provision(&host, &tools, adapter.as_ref(), &spec, &paths).unwrap();

        assert_eq!(performed.len(), 1);
        assert!(paths.data_dir.is_dir());
        assert_eq!(host.runs().len(), 1);
        assert_eq!(host.runs()[0].render(), "docker image inspect ubuntu:22.04");
    }

    #[test]
    fn container_image_is_pulled_when_missing() {
        let dir = tempdir().unwrap();
        let host = FakeHost::new();
        host.push_output("docker", 1, "", "No such image");
        let tools = test_toolchain();
        let mut spec = sample_spec("box", Backend::Container, 2223);
        spec.os.source = "ubuntu:22.04".to_string();
        let paths = InstancePaths::derive(dir.path(), "box");
        let adapter = adapter_for(Backend::Container, &tools);

        provision(&host, &tools, adapter.as_ref(), &spec, &paths).unwrap();

        assert_eq!(host.runs()[1].render(), "docker pull ubuntu:22.04");
    }

    #[test]
    fn failed_extraction_leaves_no_partial_rootfs() {
        let dir = tempdir().unwrap();
        let host = FakeHost::new();
        host.push_output("tar", 2, "", "unexpected end of archive");
        let tools = test_toolchain();
        let mut spec = sample_spec("jail", Backend::RootEmulation, 2224);
        spec.os.source = "https://example.test/root.tar.xz".to_string();
        let paths = InstancePaths::derive(dir.path(), "jail");
        let adapter = adapter_for(Backend::RootEmulation, &tools);

        let err = provision(&host, &tools, adapter.as_ref(), &spec, &paths).unwrap_err();

        assert_eq!(err.details().unwrap().raw_stderr.as_deref(), Some("unexpected end of archive"));
        assert!(!paths.rootfs_dir.exists());
        assert!(host
            .calls()
            .iter()
            .any(|call| matches!(call, Call::Download(url, _) if url.ends_with("root.tar.xz"))));
    }

    #[test]
    fn extract_keeps_ownership_with_the_caller() {
        let cmd = extract_command(Path::new("/c/root.tar.xz"), Path::new("/i/rootfs"));
        assert_eq!(cmd.render(), "tar -xf /c/root.tar.xz -C /i/rootfs --no-same-owner");
    }
}

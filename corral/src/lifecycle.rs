//! The public operations. Every state-machine rule lives here: mutations
//! only on stopped instances, delete behind a typed confirmation, and every
//! uniqueness check re-run against the on-disk registry right before commit.

use crate::allocator::Allocator;
use crate::backend::{adapter_for, BackendAdapter, Toolchain};
use crate::config::{Config, RootWrapper};
use crate::error::CorralError;
use crate::host::{execute, Host};
use crate::instance::{
    disk_size_mb, generate_password, validate_disk_size, validate_port, Backend, Credentials,
    InstancePaths, InstanceSpec, Network, OsProfile, PortForward, Resources, DEFAULT_CPUS,
    DEFAULT_DISK_SIZE, DEFAULT_MEMORY_MB, DEFAULT_SSH_PORT, DEFAULT_USERNAME,
};
use crate::provision::provision;
use crate::registry::Registry;
use crate::seed::build_seed;
use crate::supervisor::{RunState, StartOutcome, StopOutcome, Supervisor};
use chrono::{SubsecRound, Utc};
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

pub const DELETE_CONFIRMATION: &str = "DELETE";
const REDACTED: &str = "********";

/// Caller input for `create`; unset fields take the documented defaults.
#[derive(Debug, Clone)]
pub struct InstanceDraft {
    pub name: String,
    pub backend: Backend,
    pub profile: String,
    pub memory_mb: Option<u32>,
    pub cpus: Option<u32>,
    pub disk_size: Option<String>,
    pub ssh_port: Option<u32>,
    pub forwards: Vec<PortForward>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub display: bool,
}

#[derive(Debug, Clone, Default)]
pub struct InstancePatch {
    pub memory_mb: Option<u32>,
    pub cpus: Option<u32>,
    pub ssh_port: Option<u32>,
    /// `Some(vec![])` clears every extra forward.
    pub forwards: Option<Vec<PortForward>>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub display: Option<bool>,
}

impl InstancePatch {
    pub fn is_empty(&self) -> bool {
        self.memory_mb.is_none()
            && self.cpus.is_none()
            && self.ssh_port.is_none()
            && self.forwards.is_none()
            && self.username.is_none()
            && self.password.is_none()
            && self.display.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceView {
    #[serde(flatten)]
    pub spec: InstanceSpec,
    pub paths: InstancePaths,
    pub status: &'static str,
    pub pid: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceSummary {
    pub name: String,
    pub backend: Option<Backend>,
    pub ssh_port: Option<u16>,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct Controller<'a, H: Host + ?Sized> {
    registry: Registry,
    config: Config,
    tools: Toolchain,
    host: &'a H,
}

impl<'a, H: Host + ?Sized> Controller<'a, H> {
    pub fn new(config: Config, state_dir: impl Into<PathBuf>, host: &'a H) -> Self {
        let tools = Toolchain::from_config(&config);
        Self {
            registry: Registry::new(state_dir),
            config,
            tools,
            host,
        }
    }

    #[cfg(test)]
    pub fn with_toolchain(mut self, tools: Toolchain) -> Self {
        self.tools = tools;
        self
    }

    #[cfg(test)]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn supervisor(&self) -> Supervisor<'_, H> {
        Supervisor::new(
            self.host,
            Duration::from_secs(self.config.supervisor.stop_grace_secs),
        )
    }

    fn adapter(&self, spec: &InstanceSpec) -> Box<dyn BackendAdapter> {
        adapter_for(spec.backend, &self.tools)
    }

    fn spec_from_draft(&self, draft: InstanceDraft) -> Result<InstanceSpec, CorralError> {
        let profile = self.config.profiles.get(&draft.profile).ok_or_else(|| {
            let known: Vec<&str> = self.config.profiles.keys().map(String::as_str).collect();
            CorralError::Validation(format!(
                "unknown profile '{}'; available: {}",
                draft.profile,
                known.join(", ")
            ))
        })?;
        let source = profile.source_for(draft.backend).trim().to_string();
        let needs_source = !(draft.backend == Backend::RootEmulation
            && self.tools.root_wrapper == RootWrapper::Fakeroot);
        if source.is_empty() && needs_source {
            return Err(CorralError::Validation(format!(
                "profile '{}' has no image source for the {} backend",
                draft.profile, draft.backend
            )));
        }
        let ssh_port = validate_port(draft.ssh_port.unwrap_or(u32::from(DEFAULT_SSH_PORT)))?;
        let spec = InstanceSpec {
            name: draft.name,
            backend: draft.backend,
            os: OsProfile {
                name: profile.name.clone(),
                version: profile.version.clone(),
                source,
            },
            resources: Resources {
                memory_mb: draft.memory_mb.unwrap_or(DEFAULT_MEMORY_MB),
                cpus: draft.cpus.unwrap_or(DEFAULT_CPUS),
                disk_size: draft
                    .disk_size
                    .unwrap_or_else(|| DEFAULT_DISK_SIZE.to_string()),
            },
            network: Network {
                ssh_port,
                forwards: draft.forwards,
            },
            credentials: Credentials {
                username: draft
                    .username
                    .unwrap_or_else(|| DEFAULT_USERNAME.to_string()),
                password: draft.password.unwrap_or_else(generate_password),
            },
            display: draft.display,
            root_wrapper: (draft.backend == Backend::RootEmulation)
                .then_some(self.tools.root_wrapper),
            created_at: Utc::now().trunc_subsecs(0),
        };
        spec.validate()?;
        Ok(spec)
    }

    pub fn create(&self, draft: InstanceDraft) -> Result<InstanceSpec, CorralError> {
        let spec = self.spec_from_draft(draft)?;
        let allocator = Allocator::scan(&self.registry)?;
        allocator.reserve_name(&spec.name)?;
        allocator.reserve_ports(&spec, None)?;

        let paths = self.registry.paths(&spec.name);
        if paths.instance_dir.exists() {
            tracing::warn!(instance = %spec.name, "removing leftover artifacts without a record");
            fs::remove_dir_all(&paths.instance_dir)?;
        }

        let result = self.provision_and_commit(&spec, &paths);
        if result.is_err() {
            let _ = fs::remove_dir_all(&paths.instance_dir);
        }
        result?;
        tracing::info!(
            instance = %spec.name,
            backend = %spec.backend,
            port = spec.network.ssh_port,
            "created"
        );
        Ok(spec)
    }

    fn provision_and_commit(
        &self,
        spec: &InstanceSpec,
        paths: &InstancePaths,
    ) -> Result<(), CorralError> {
        let adapter = self.adapter(spec);
        provision(self.host, &self.tools, adapter.as_ref(), spec, paths)?;
        // Provisioning can take minutes; someone else may have claimed the
        // name or a port meanwhile.
        let allocator = Allocator::scan(&self.registry)?;
        allocator.reserve_name(&spec.name)?;
        allocator.reserve_ports(spec, None)?;
        self.registry.save(spec)
    }

    pub fn status(&self, name: &str) -> Result<RunState, CorralError> {
        let spec = self.registry.load(name)?;
        let paths = self.registry.paths(name);
        self.supervisor()
            .status(self.adapter(&spec).as_ref(), &spec, &paths)
    }

    pub fn start(&self, name: &str) -> Result<StartOutcome, CorralError> {
        let spec = self.registry.load(name)?;
        let paths = self.registry.paths(name);
        let adapter = self.adapter(&spec);
        let supervisor = self.supervisor();
        if let RunState::Running { pid } = supervisor.status(adapter.as_ref(), &spec, &paths)? {
            return Ok(StartOutcome::AlreadyRunning { pid });
        }
        let rebuilt = provision(self.host, &self.tools, adapter.as_ref(), &spec, &paths)?;
        if !rebuilt.is_empty() {
            tracing::info!(instance = %name, steps = rebuilt.len(), "recreated missing artifacts");
        }
        supervisor.start(adapter.as_ref(), &spec, &paths)
    }

    pub fn stop(&self, name: &str) -> Result<StopOutcome, CorralError> {
        let spec = self.registry.load(name)?;
        let paths = self.registry.paths(name);
        self.supervisor()
            .stop(self.adapter(&spec).as_ref(), &spec, &paths)
    }

    fn require_stopped(&self, spec: &InstanceSpec, action: &str) -> Result<(), CorralError> {
        let paths = self.registry.paths(&spec.name);
        let state = self
            .supervisor()
            .status(self.adapter(spec).as_ref(), spec, &paths)?;
        if state.is_running() {
            return Err(CorralError::Precondition(format!(
                "instance '{}' is running; stop it before you {action} it",
                spec.name
            )));
        }
        Ok(())
    }

    pub fn edit(&self, name: &str, patch: InstancePatch) -> Result<InstanceSpec, CorralError> {
        if patch.is_empty() {
            return Err(CorralError::Validation(
                "nothing to change; pass at least one field to edit".to_string(),
            ));
        }
        let current = self.registry.load(name)?;
        self.require_stopped(&current, "edit")?;

        let mut updated = current.clone();
        if let Some(memory_mb) = patch.memory_mb {
            updated.resources.memory_mb = memory_mb;
        }
        if let Some(cpus) = patch.cpus {
            updated.resources.cpus = cpus;
        }
        if let Some(port) = patch.ssh_port {
            updated.network.ssh_port = validate_port(port)?;
        }
        if let Some(forwards) = patch.forwards {
            updated.network.forwards = forwards;
        }
        if let Some(username) = patch.username {
            updated.credentials.username = username;
        }
        if let Some(password) = patch.password {
            updated.credentials.password = password;
        }
        if let Some(display) = patch.display {
            updated.display = display;
        }
        updated.validate()?;

        if updated.host_ports() != current.host_ports() {
            Allocator::scan(&self.registry)?.reserve_ports(&updated, Some(name))?;
        }

        let adapter = self.adapter(&updated);
        if updated.credentials != current.credentials && adapter.uses_seed() {
            let paths = self.registry.paths(name);
            fs::create_dir_all(&paths.instance_dir)?;
            build_seed(self.host, &self.tools, &updated, &paths)?;
        }
        self.registry.save(&updated)?;
        tracing::info!(instance = %name, "edited");
        Ok(updated)
    }

    /// Grows the disk. The record only changes after the backend succeeded.
    pub fn resize(&self, name: &str, size: &str) -> Result<InstanceSpec, CorralError> {
        validate_disk_size(size)?;
        let current = self.registry.load(name)?;
        self.require_stopped(&current, "resize")?;

        let requested = disk_size_mb(size)?;
        let existing = disk_size_mb(&current.resources.disk_size)?;
        if requested < existing {
            return Err(CorralError::Validation(format!(
                "cannot shrink '{name}' from {} to {size}; disks can only grow",
                current.resources.disk_size
            )));
        }
        if requested == existing {
            return Ok(current);
        }

        let paths = self.registry.paths(name);
        let command = self
            .adapter(&current)
            .resize_command(&current, &paths, size)?;
        execute(self.host, &command, None)?;

        let mut updated = current;
        updated.resources.disk_size = size.to_string();
        self.registry.save(&updated)?;
        tracing::info!(instance = %name, size, "resized");
        Ok(updated)
    }

    /// A record that no longer parses can still be deleted; its liveness is
    /// then judged by the pid file alone.
    pub fn delete(&self, name: &str, confirmation: &str) -> Result<(), CorralError> {
        let loaded = match self.registry.load(name) {
            Ok(spec) => Some(spec),
            Err(CorralError::Record { message, .. }) => {
                tracing::warn!(instance = %name, error = %message, "record is unreadable");
                None
            }
            Err(err) => return Err(err),
        };
        if confirmation != DELETE_CONFIRMATION {
            return Err(CorralError::Precondition(format!(
                "deleting '{name}' is irreversible; confirm with {DELETE_CONFIRMATION}"
            )));
        }

        match &loaded {
            Some(spec) => {
                self.require_stopped(spec, "delete")?;
                if let Some(command) = self.adapter(spec).cleanup_command(spec) {
                    if let Err(err) = execute(self.host, &command, None) {
                        tracing::debug!(instance = %name, error = %err, "engine cleanup skipped");
                    }
                }
            }
            None => {
                let paths = self.registry.paths(name);
                if let Some(pid) = self.supervisor().recorded_pid_alive(&paths)? {
                    return Err(CorralError::Precondition(format!(
                        "instance '{name}' still has a live process (pid {pid}); stop it before you delete it"
                    )));
                }
            }
        }
        self.registry.remove(name)?;
        tracing::info!(instance = %name, "deleted");
        Ok(())
    }

    pub fn describe(&self, name: &str, show_password: bool) -> Result<InstanceView, CorralError> {
        let mut spec = self.registry.load(name)?;
        let paths = self.registry.paths(name);
        let state = self
            .supervisor()
            .status(self.adapter(&spec).as_ref(), &spec, &paths)?;
        if !show_password {
            spec.credentials.password = REDACTED.to_string();
        }
        Ok(InstanceView {
            spec,
            paths,
            status: state.label(),
            pid: state.pid(),
        })
    }

    /// One entry per record, sorted by name. A broken record or an
    /// unreachable engine shows up in its entry instead of failing the list.
    pub fn list(&self) -> Result<Vec<InstanceSummary>, CorralError> {
        let mut summaries = Vec::new();
        for name in self.registry.list()? {
            let spec = match self.registry.load(&name) {
                Ok(spec) => spec,
                Err(err) => {
                    summaries.push(InstanceSummary {
                        name,
                        backend: None,
                        ssh_port: None,
                        status: "invalid".to_string(),
                        error: Some(err.to_string()),
                    });
                    continue;
                }
            };
            let paths = self.registry.paths(&name);
            let (status, error) =
                match self
                    .supervisor()
                    .status(self.adapter(&spec).as_ref(), &spec, &paths)
                {
                    Ok(state) => (state.label().to_string(), None),
                    Err(err) => ("unknown".to_string(), Some(err.to_string())),
                };
            summaries.push(InstanceSummary {
                name,
                backend: Some(spec.backend),
                ssh_port: Some(spec.network.ssh_port),
                status,
                error,
            });
        }
        Ok(summaries)
    }
}

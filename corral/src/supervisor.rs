//! Starts, observes and stops backend processes.
//!
//! The pid file is a hint, never the truth: `status` reconciles it against
//! the live process table (or the engine) on every call, so a pid file left
//! behind by an interrupted foreground session heals on the next check.

use crate::backend::{BackendAdapter, LaunchMode, Liveness};
use crate::error::{classify_command_failure, spawn_error_details, CorralError, ProcessErrorDetails};
use crate::host::{command_failure, execute, CommandLine, Host, ProcessEntry, Signal};
use crate::instance::{InstancePaths, InstanceSpec};
use crate::registry::write_atomic_text_file;
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

pub const STARTUP_SETTLE: Duration = Duration::from_millis(500);
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const EXIT_POLL_ATTEMPTS: usize = 10;
const LOG_TAIL_LINES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    Running { pid: Option<u32> },
    Stopped,
}

impl RunState {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running { .. })
    }

    pub fn pid(&self) -> Option<u32> {
        match self {
            Self::Running { pid } => *pid,
            Self::Stopped => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Running { .. } => "running",
            Self::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StartOutcome {
    Started { pid: Option<u32> },
    AlreadyRunning { pid: Option<u32> },
    /// A foreground session ran and the guest has exited again.
    Exited { code: i32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StopOutcome {
    Stopped { forced: bool },
    NotRunning,
}

pub struct Supervisor<'a, H: Host + ?Sized> {
    host: &'a H,
    grace: Duration,
    settle: Duration,
}

impl<'a, H: Host + ?Sized> Supervisor<'a, H> {
    pub fn new(host: &'a H, grace: Duration) -> Self {
        Self {
            host,
            grace,
            settle: STARTUP_SETTLE,
        }
    }

    pub fn status(
        &self,
        adapter: &dyn BackendAdapter,
        spec: &InstanceSpec,
        paths: &InstancePaths,
    ) -> Result<RunState, CorralError> {
        let recorded = read_pid_file(&paths.pid_file);
        match adapter.liveness(spec, paths) {
            Liveness::ProcessMarker(token) => {
                let matches = marker_pids(&self.host.processes()?, &token);
                if let Some(pid) = recorded.filter(|pid| matches.contains(pid)) {
                    return Ok(RunState::Running { pid: Some(pid) });
                }
                if let Some(&pid) = matches.first() {
                    if paths.instance_dir.is_dir() {
                        write_pid_file(&paths.pid_file, pid)?;
                    }
                    tracing::debug!(instance = %spec.name, pid, "adopted live process");
                    return Ok(RunState::Running { pid: Some(pid) });
                }
            }
            Liveness::EngineQuery(query) => {
                let rendered = query.render();
                let output = self.host.run(&query, None).map_err(|err| CorralError::Backend {
                    message: format!("failed to query engine with `{rendered}`: {err}"),
                    details: spawn_error_details(&err, &query.program, &rendered),
                })?;
                if output.success() {
                    if output.stdout_text() == "true" {
                        return Ok(RunState::Running { pid: recorded });
                    }
                } else {
                    let stderr = output.stderr_text();
                    if !engine_reports_missing(&stderr) {
                        return Err(command_failure(&query, output.status_code, &stderr));
                    }
                }
            }
            Liveness::PidFileOnly => {
                if let Some(pid) = recorded {
                    if self.pid_alive(pid)? {
                        return Ok(RunState::Running { pid: Some(pid) });
                    }
                }
            }
        }
        if recorded.is_some() {
            tracing::debug!(instance = %spec.name, "removing stale pid file");
            clear_pid_file(&paths.pid_file)?;
        }
        Ok(RunState::Stopped)
    }

    pub fn start(
        &self,
        adapter: &dyn BackendAdapter,
        spec: &InstanceSpec,
        paths: &InstancePaths,
    ) -> Result<StartOutcome, CorralError> {
        if let RunState::Running { pid } = self.status(adapter, spec, paths)? {
            return Ok(StartOutcome::AlreadyRunning { pid });
        }
        fs::create_dir_all(&paths.instance_dir)?;
        let plan = adapter.launch_plan(spec, paths);
        tracing::info!(
            instance = %spec.name,
            backend = %spec.backend,
            command = %plan.command.render(),
            "launching"
        );
        match plan.mode {
            LaunchMode::Foreground => self.run_foreground(&plan.command, paths),
            LaunchMode::Background => self.run_background(adapter, spec, paths, &plan.command),
            LaunchMode::EngineManaged => {
                execute(self.host, &plan.command, None)?;
                Ok(StartOutcome::Started { pid: None })
            }
        }
    }

    fn run_foreground(
        &self,
        command: &CommandLine,
        paths: &InstancePaths,
    ) -> Result<StartOutcome, CorralError> {
        let mut record_err = None;
        let result = self.host.run_attached(command, &mut |pid| {
            if let Err(err) = write_pid_file(&paths.pid_file, pid) {
                record_err = Some(err);
            }
        });
        clear_pid_file(&paths.pid_file)?;
        let rendered = command.render();
        let output = result.map_err(|err| CorralError::Backend {
            message: format!("failed to launch `{rendered}`: {err}"),
            details: spawn_error_details(&err, &command.program, &rendered),
        })?;
        if let Some(err) = record_err {
            tracing::warn!(error = %err, "could not record foreground pid");
        }
        if !output.success() {
            return Err(command_failure(command, output.status_code, &output.stderr_text()));
        }
        Ok(StartOutcome::Exited {
            code: output.status_code,
        })
    }

    fn run_background(
        &self,
        adapter: &dyn BackendAdapter,
        spec: &InstanceSpec,
        paths: &InstancePaths,
        command: &CommandLine,
    ) -> Result<StartOutcome, CorralError> {
        let rendered = command.render();
        let pid = self
            .host
            .spawn_detached(command, &paths.console_log)
            .map_err(|err| CorralError::Backend {
                message: format!("failed to launch `{rendered}`: {err}"),
                details: spawn_error_details(&err, &command.program, &rendered),
            })?;
        write_pid_file(&paths.pid_file, pid)?;
        self.host.sleep(self.settle);
        if self.status(adapter, spec, paths)?.is_running() {
            tracing::info!(instance = %spec.name, pid, "running in background");
            return Ok(StartOutcome::Started { pid: Some(pid) });
        }
        clear_pid_file(&paths.pid_file)?;
        let tail = log_tail(&paths.console_log, LOG_TAIL_LINES);
        let (error_code, hint) = classify_command_failure(&tail);
        let mut message = format!("`{rendered}` exited during startup");
        if !tail.is_empty() {
            message = format!("{message}; last output:\n{tail}");
        }
        Err(CorralError::Backend {
            message,
            details: ProcessErrorDetails {
                error_code,
                hint,
                command: Some(rendered),
                raw_stderr: if tail.is_empty() { None } else { Some(tail) },
            },
        })
    }

    pub fn stop(
        &self,
        adapter: &dyn BackendAdapter,
        spec: &InstanceSpec,
        paths: &InstancePaths,
    ) -> Result<StopOutcome, CorralError> {
        if !self.status(adapter, spec, paths)?.is_running() {
            return Ok(StopOutcome::NotRunning);
        }

        match adapter.stop_command(spec) {
            Some(command) => {
                if let Err(err) = execute(self.host, &command, None) {
                    tracing::warn!(instance = %spec.name, error = %err, "stop command failed");
                }
            }
            None => self.signal_all(adapter, spec, paths, Signal::Term)?,
        }
        self.host.sleep(self.grace);

        let mut forced = false;
        if self.status(adapter, spec, paths)?.is_running() {
            forced = true;
            tracing::warn!(instance = %spec.name, "still running after grace period; forcing");
            match adapter.force_stop_command(spec) {
                Some(command) => {
                    if let Err(err) = execute(self.host, &command, None) {
                        tracing::warn!(instance = %spec.name, error = %err, "force stop command failed");
                    }
                }
                None => self.signal_all(adapter, spec, paths, Signal::Kill)?,
            }
            if !self.wait_for_exit(adapter, spec, paths)? {
                return Err(CorralError::backend(format!(
                    "instance '{}' did not exit after a forced stop",
                    spec.name
                )));
            }
        }

        clear_pid_file(&paths.pid_file)?;
        tracing::info!(instance = %spec.name, forced, "stopped");
        Ok(StopOutcome::Stopped { forced })
    }

    fn wait_for_exit(
        &self,
        adapter: &dyn BackendAdapter,
        spec: &InstanceSpec,
        paths: &InstancePaths,
    ) -> Result<bool, CorralError> {
        for _ in 0..EXIT_POLL_ATTEMPTS {
            if !self.status(adapter, spec, paths)?.is_running() {
                return Ok(true);
            }
            self.host.sleep(EXIT_POLL_INTERVAL);
        }
        Ok(!self.status(adapter, spec, paths)?.is_running())
    }

    /// Signals the recorded pid and, for marker-based backends, every
    /// process carrying the marker.
    fn signal_all(
        &self,
        adapter: &dyn BackendAdapter,
        spec: &InstanceSpec,
        paths: &InstancePaths,
        signal: Signal,
    ) -> Result<(), CorralError> {
        let mut targets = Vec::new();
        if let Liveness::ProcessMarker(token) = adapter.liveness(spec, paths) {
            targets = marker_pids(&self.host.processes()?, &token);
        }
        if let Some(pid) = read_pid_file(&paths.pid_file) {
            if !targets.contains(&pid) {
                targets.push(pid);
            }
        }
        for pid in targets {
            tracing::debug!(instance = %spec.name, pid, signal = signal.as_str(), "signalling");
            if !self.host.signal(pid, signal)? {
                tracing::debug!(pid, "process already gone");
            }
        }
        Ok(())
    }

    /// Liveness from the pid file alone, for records no adapter can be built from.
    pub fn recorded_pid_alive(&self, paths: &InstancePaths) -> Result<Option<u32>, CorralError> {
        match read_pid_file(&paths.pid_file) {
            Some(pid) if self.pid_alive(pid)? => Ok(Some(pid)),
            _ => Ok(None),
        }
    }

    fn pid_alive(&self, pid: u32) -> Result<bool, CorralError> {
        Ok(pid != 0 && self.host.processes()?.iter().any(|entry| entry.pid == pid))
    }
}

/// The only inspect failure that means "not running": the engine answered
/// and has no such container.
fn engine_reports_missing(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("no such object") || lower.contains("no such container")
}

fn marker_pids(table: &[ProcessEntry], token: &str) -> Vec<u32> {
    table
        .iter()
        .filter(|entry| entry.has_token(token))
        .map(|entry| entry.pid)
        .collect()
}

pub fn read_pid_file(path: &Path) -> Option<u32> {
    let text = fs::read_to_string(path).ok()?;
    text.trim().parse::<u32>().ok().filter(|pid| *pid != 0)
}

fn write_pid_file(path: &Path, pid: u32) -> Result<(), CorralError> {
    write_atomic_text_file(path, &format!("{pid}\n"), None)
}

fn clear_pid_file(path: &Path) -> Result<(), CorralError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn log_tail(path: &Path, lines: usize) -> String {
    let Ok(text) = fs::read_to_string(path) else {
        return String::new();
    };
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n").trim().to_string()
}

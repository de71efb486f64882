//! Process-level side effects behind one trait, so the supervisor and
//! provisioner can be exercised against a fake host in tests.

use crate::error::{classify_command_failure, spawn_error_details, CorralError, ProcessErrorDetails};
use crate::registry::ensure_parent;
use serde::Serialize;
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn render(&self) -> String {
        fn shell_quote(part: &str) -> String {
            if part.is_empty() {
                return "\"\"".to_string();
            }
            if part.chars().any(|c| c.is_whitespace()) {
                return format!("\"{}\"", part.replace('"', "\\\""));
            }
            part.to_string()
        }
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(shell_quote(&self.program));
        parts.extend(self.args.iter().map(|arg| shell_quote(arg)));
        parts.join(" ")
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == 0
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub argv: Vec<String>,
}

impl ProcessEntry {
    pub fn has_token(&self, token: &str) -> bool {
        self.argv.iter().any(|arg| arg == token)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Term,
    Kill,
}

impl Signal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Term => "TERM",
            Self::Kill => "KILL",
        }
    }
}

pub trait Host {
    /// Runs to completion with captured output.
    fn run(&self, command: &CommandLine, stdin: Option<&[u8]>) -> io::Result<CommandOutput>;

    /// Runs with the terminal attached; `on_spawn` sees the child pid before the wait.
    fn run_attached(
        &self,
        command: &CommandLine,
        on_spawn: &mut dyn FnMut(u32),
    ) -> io::Result<CommandOutput>;

    /// Starts a child that outlives this process, stdout/stderr appended to `log_path`.
    fn spawn_detached(&self, command: &CommandLine, log_path: &Path) -> io::Result<u32>;

    fn processes(&self) -> io::Result<Vec<ProcessEntry>>;

    fn signal(&self, pid: u32, signal: Signal) -> io::Result<bool>;

    fn download(&self, url: &str, dest: &Path) -> Result<(), CorralError>;

    fn sleep(&self, duration: Duration);
}

pub struct SystemHost;

impl Host for SystemHost {
    fn run(&self, command: &CommandLine, stdin: Option<&[u8]>) -> io::Result<CommandOutput> {
        let mut cmd = command.to_command();
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        let mut child = cmd.spawn()?;
        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input)?;
        }
        let output = child.wait_with_output()?;
        let status_code = output
            .status
            .code()
            .unwrap_or(if output.status.success() { 0 } else { 1 });
        Ok(CommandOutput {
            status_code,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    fn run_attached(
        &self,
        command: &CommandLine,
        on_spawn: &mut dyn FnMut(u32),
    ) -> io::Result<CommandOutput> {
        let mut child = command.to_command().spawn()?;
        on_spawn(child.id());
        let status = child.wait()?;
        let status_code = status.code().unwrap_or(if status.success() { 0 } else { 1 });
        Ok(CommandOutput {
            status_code,
            stdout: Vec::new(),
            stderr: Vec::new(),
        })
    }

    fn spawn_detached(&self, command: &CommandLine, log_path: &Path) -> io::Result<u32> {
        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let log = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;
        let mut cmd = command.to_command();
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::from(log.try_clone()?));
        cmd.stderr(Stdio::from(log));
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Own process group, so a ctrl-c in the launching terminal does not reach the guest.
            cmd.process_group(0);
        }
        let child = cmd.spawn()?;
        Ok(child.id())
    }

    fn processes(&self) -> io::Result<Vec<ProcessEntry>> {
        #[cfg(target_os = "linux")]
        {
            let mut entries = Vec::new();
            for entry in fs::read_dir("/proc")? {
                let Ok(entry) = entry else { continue };
                let Some(pid) = entry
                    .file_name()
                    .to_str()
                    .and_then(|name| name.parse::<u32>().ok())
                else {
                    continue;
                };
                let Ok(raw) = fs::read(entry.path().join("cmdline")) else {
                    continue;
                };
                let argv: Vec<String> = raw
                    .split(|byte| *byte == 0)
                    .filter(|part| !part.is_empty())
                    .map(|part| String::from_utf8_lossy(part).to_string())
                    .collect();
                if !argv.is_empty() {
                    entries.push(ProcessEntry { pid, argv });
                }
            }
            Ok(entries)
        }
        #[cfg(not(target_os = "linux"))]
        {
            let output = Command::new("ps").args(["-eo", "pid=,args="]).output()?;
            Ok(parse_ps_output(&String::from_utf8_lossy(&output.stdout)))
        }
    }

    fn signal(&self, pid: u32, signal: Signal) -> io::Result<bool> {
        if pid == 0 {
            return Ok(false);
        }
        let status = Command::new("kill")
            .arg("-s")
            .arg(signal.as_str())
            .arg(pid.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;
        Ok(status.success())
    }

    fn download(&self, url: &str, dest: &Path) -> Result<(), CorralError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(None::<Duration>)
            .build()?;
        let mut response = client.get(url).header("User-Agent", "corral-cli").send()?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(CorralError::backend(format!(
                "download failed: {url} (HTTP {status} {body})"
            )));
        }
        ensure_parent(dest)?;
        let partial = dest.with_extension("part");
        let mut file = fs::File::create(&partial)?;
        if let Err(err) = io::copy(&mut response, &mut file) {
            let _ = fs::remove_file(&partial);
            return Err(CorralError::backend(format!("download of {url} interrupted: {err}")));
        }
        file.sync_all()?;
        fs::rename(&partial, dest)?;
        Ok(())
    }

    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            thread::sleep(duration);
        }
    }
}

#[cfg_attr(target_os = "linux", allow(dead_code))]
fn parse_ps_output(text: &str) -> Vec<ProcessEntry> {
    text.lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let pid = parts.next()?.parse::<u32>().ok()?;
            let argv: Vec<String> = parts.map(str::to_string).collect();
            if argv.is_empty() {
                None
            } else {
                Some(ProcessEntry { pid, argv })
            }
        })
        .collect()
}

/// Runs `command` to completion and turns spawn failures and non-zero exits
/// into backend errors carrying the engine's stderr.
pub fn execute<H: Host + ?Sized>(
    host: &H,
    command: &CommandLine,
    stdin: Option<&[u8]>,
) -> Result<CommandOutput, CorralError> {
    let rendered = command.render();
    tracing::debug!(command = %rendered, "running");
    let output = host.run(command, stdin).map_err(|err| CorralError::Backend {
        message: format!("failed to run `{rendered}`: {err}"),
        details: spawn_error_details(&err, &command.program, &rendered),
    })?;
    if output.success() {
        return Ok(output);
    }
    Err(command_failure(command, output.status_code, &output.stderr_text()))
}

pub fn command_failure(command: &CommandLine, status_code: i32, stderr: &str) -> CorralError {
    let rendered = command.render();
    let (error_code, hint) = classify_command_failure(stderr);
    let mut message = format!("command failed with status {status_code} while running `{rendered}`");
    if !stderr.is_empty() {
        message = format!("{message}: {stderr}");
    }
    if let Some(ref hint_message) = hint {
        message = format!("{message}\nHint: {hint_message}");
    }
    CorralError::Backend {
        message,
        details: ProcessErrorDetails {
            error_code,
            hint,
            command: Some(rendered),
            raw_stderr: if stderr.is_empty() {
                None
            } else {
                Some(stderr.to_string())
            },
        },
    }
}


#[cfg(test)]
mod tests {
    use super::fake::FakeHost;
    use super::*;

    #[test]
    fn render_quotes_arguments_with_spaces() {
        let cmd = CommandLine::new("qemu-img")
            .args(["resize", "/var/lib/my disks/web.qcow2"])
            .arg("30G");
        assert_eq!(
            cmd.render(),
            "qemu-img resize \"/var/lib/my disks/web.qcow2\" 30G"
        );
    }

    #[test]
    fn ps_output_is_split_into_pid_and_argv() {
        let entries = parse_ps_output("  12 qemu-system-x86_64 -name corral-web\n  bad line\n 40 sleep 5\n");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].pid, 12);
        assert!(entries[0].has_token("corral-web"));
        assert!(!entries[0].has_token("corral-we"));
        assert_eq!(entries[1].argv, vec!["sleep", "5"]);
    }

    #[test]
    fn execute_maps_non_zero_exit_to_backend_error() {
        let host = FakeHost::new();
        host.push_output("docker", 125, "", "Cannot connect to the Docker daemon at unix:///var/run/docker.sock");
        let err = execute(&host, &CommandLine::new("docker").arg("ps"), None).unwrap_err();
        let details = err.details().cloned().expect("details");
        assert_eq!(details.error_code, "engine_unreachable");
        assert_eq!(details.command.as_deref(), Some("docker ps"));
        assert!(details.raw_stderr.is_some());
    }

    #[test]
    fn execute_maps_missing_binary_to_backend_error() {
        let host = FakeHost::new();
        let err = execute(&host, &CommandLine::new("missing-binary"), None).unwrap_err();
        assert_eq!(err.kind(), "backend");
        assert_eq!(err.details().unwrap().error_code, "binary_not_found");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn system_host_sees_its_own_process() {
        let me = std::process::id();
        let entries = SystemHost.processes().unwrap();
        assert!(entries.iter().any(|entry| entry.pid == me));
    }
}

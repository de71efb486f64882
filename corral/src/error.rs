use serde::Serialize;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CorralError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("instance not found: {0}")]
    NotFound(String),
    #[error("precondition failed: {0}")]
    Precondition(String),
    #[error("backend error: {message}")]
    Backend {
        message: String,
        details: ProcessErrorDetails,
    },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("registry record '{name}' is invalid: {message}")]
    Record { name: String, message: String },
    #[error("config error: {0}")]
    Config(String),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("prompt error: {0}")]
    Prompt(#[from] dialoguer::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProcessErrorDetails {
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_stderr: Option<String>,
}

impl CorralError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Conflict(_) => "conflict",
            Self::NotFound(_) => "not_found",
            Self::Precondition(_) => "precondition",
            Self::Backend { .. } => "backend",
            Self::Io(_) | Self::Record { .. } => "io",
            Self::Config(_) | Self::Yaml(_) => "config",
            Self::Json(_) => "json",
            Self::Prompt(_) => "prompt",
            Self::Http(_) => "backend",
        }
    }

    pub fn details(&self) -> Option<&ProcessErrorDetails> {
        match self {
            Self::Backend { details, .. } => Some(details),
            _ => None,
        }
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
            details: ProcessErrorDetails {
                error_code: "backend_failed".to_string(),
                hint: None,
                command: None,
                raw_stderr: None,
            },
        }
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
            details: ProcessErrorDetails {
                error_code: "backend_unsupported".to_string(),
                hint: None,
                command: None,
                raw_stderr: None,
            },
        }
    }
}

pub fn spawn_error_details(err: &io::Error, program: &str, command: &str) -> ProcessErrorDetails {
    if err.kind() == io::ErrorKind::NotFound {
        return ProcessErrorDetails {
            error_code: "binary_not_found".to_string(),
            hint: Some(format!(
                "Install `{program}` and ensure it is on your PATH, or point the matching `tools` entry in config.yaml at it."
            )),
            command: Some(command.to_string()),
            raw_stderr: None,
        };
    }
    ProcessErrorDetails {
        error_code: "process_command_failed".to_string(),
        hint: None,
        command: Some(command.to_string()),
        raw_stderr: None,
    }
}

pub fn classify_command_failure(stderr: &str) -> (String, Option<String>) {
    let lower = stderr.to_lowercase();

    if lower.contains("/dev/kvm")
        && (lower.contains("permission denied") || lower.contains("could not access"))
    {
        return (
            "kvm_unavailable".to_string(),
            Some(
                "Add your user to the `kvm` group or run without hardware acceleration."
                    .to_string(),
            ),
        );
    }

    if lower.contains("cannot connect to the docker daemon")
        || lower.contains("is the docker daemon running")
        || lower.contains("error during connect")
    {
        return (
            "engine_unreachable".to_string(),
            Some("The container engine daemon is unreachable. Start it and retry.".to_string()),
        );
    }

    if lower.contains("is already in use by container") {
        return (
            "engine_name_in_use".to_string(),
            Some("A container with this name already exists; remove it with `docker rm -f <name>`.".to_string()),
        );
    }

    if lower.contains("could not set up host forwarding")
        || lower.contains("port is already allocated")
        || lower.contains("address already in use")
    {
        return (
            "host_port_in_use".to_string(),
            Some("A forwarded host port is held by another process. Free it or edit the instance ports.".to_string()),
        );
    }

    if lower.contains("no space left on device") {
        return ("disk_full".to_string(), None);
    }

    ("process_command_failed".to_string(), None)
}

use crate::config::RootWrapper;
use crate::error::CorralError;
use chrono::{DateTime, Utc};
use rand::distr::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const DEFAULT_MEMORY_MB: u32 = 2048;
pub const DEFAULT_CPUS: u32 = 2;
pub const DEFAULT_SSH_PORT: u16 = 2222;
pub const DEFAULT_USERNAME: &str = "user";
pub const DEFAULT_DISK_SIZE: &str = "20G";
pub const MAX_NAME_LEN: usize = 63;
pub const MAX_USERNAME_LEN: usize = 32;
pub const MIN_PASSWORD_LEN: usize = 8;
pub const GENERATED_PASSWORD_LEN: usize = 16;
pub const MIN_MEMORY_MB: u32 = 128;
pub const MAX_CPUS: u32 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Backend {
    #[serde(rename = "vm")]
    Vm,
    #[serde(rename = "container")]
    Container,
    #[serde(rename = "rootfs")]
    RootEmulation,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vm => "vm",
            Self::Container => "container",
            Self::RootEmulation => "rootfs",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "vm" | "qemu" => Ok(Self::Vm),
            "container" | "docker" => Ok(Self::Container),
            "rootfs" | "proot" | "fakeroot" => Ok(Self::RootEmulation),
            other => Err(format!(
                "unknown backend '{other}'; expected one of: vm, container, rootfs"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OsProfile {
    pub name: String,
    pub version: String,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resources {
    pub memory_mb: u32,
    pub cpus: u32,
    pub disk_size: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PortForward {
    pub host: u16,
    pub guest: u16,
}

impl fmt::Display for PortForward {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.guest)
    }
}

impl FromStr for PortForward {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let Some((host, guest)) = value.trim().split_once(':') else {
            return Err(format!("port forward '{value}' must look like HOST:GUEST"));
        };
        let parse = |raw: &str, side: &str| -> Result<u16, String> {
            let number: u32 = raw
                .trim()
                .parse()
                .map_err(|_| format!("{side} port '{raw}' in '{value}' is not a number"))?;
            validate_port(number).map_err(|err| err.to_string())
        };
        Ok(Self {
            host: parse(host, "host")?,
            guest: parse(guest, "guest")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Network {
    pub ssh_port: u16,
    pub forwards: Vec<PortForward>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceSpec {
    pub name: String,
    pub backend: Backend,
    pub os: OsProfile,
    pub resources: Resources,
    pub network: Network,
    pub credentials: Credentials,
    pub display: bool,
    /// Wrapper chosen at create time for rootfs instances; `None` for other
    /// backends and for hand-written records that leave it to config.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_wrapper: Option<RootWrapper>,
    pub created_at: DateTime<Utc>,
}

impl InstanceSpec {
    /// Primary forwarded port first, then the extra rules in their stored order.
    pub fn host_ports(&self) -> Vec<u16> {
        let mut ports = Vec::with_capacity(self.network.forwards.len() + 1);
        ports.push(self.network.ssh_port);
        ports.extend(self.network.forwards.iter().map(|rule| rule.host));
        ports
    }

    pub fn validate(&self) -> Result<(), CorralError> {
        validate_name(&self.name)?;
        validate_memory(self.resources.memory_mb)?;
        validate_cpus(self.resources.cpus)?;
        validate_disk_size(&self.resources.disk_size)?;
        validate_port(u32::from(self.network.ssh_port))?;
        for rule in &self.network.forwards {
            validate_port(u32::from(rule.host))?;
            validate_port(u32::from(rule.guest))?;
        }
        validate_username(&self.credentials.username)?;
        validate_password(&self.credentials.password)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstancePaths {
    pub instance_dir: PathBuf,
    pub disk_image: PathBuf,
    pub rootfs_dir: PathBuf,
    pub data_dir: PathBuf,
    pub seed_dir: PathBuf,
    pub seed_image: PathBuf,
    pub pid_file: PathBuf,
    pub console_log: PathBuf,
    pub image_cache: PathBuf,
}

impl InstancePaths {
    pub fn derive(state_dir: &Path, name: &str) -> Self {
        let instance_dir = state_dir.join("instances").join(name);
        Self {
            disk_image: instance_dir.join("disk.qcow2"),
            rootfs_dir: instance_dir.join("rootfs"),
            data_dir: instance_dir.join("data"),
            seed_dir: instance_dir.join("seed"),
            seed_image: instance_dir.join("seed.iso"),
            pid_file: instance_dir.join(format!("{name}.pid")),
            console_log: instance_dir.join("console.log"),
            image_cache: state_dir.join("images"),
            instance_dir,
        }
    }

    /// Cached download location for a source URL, keyed by its last path segment.
    pub fn cached_source(&self, url: &str) -> PathBuf {
        let without_query = url.split(['?', '#']).next().unwrap_or(url);
        let file_name = without_query
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|segment| !segment.is_empty())
            .unwrap_or("image");
        self.image_cache.join(file_name)
    }
}

pub fn validate_name(name: &str) -> Result<(), CorralError> {
    if name.is_empty() {
        return Err(CorralError::Validation(
            "instance name must not be empty".to_string(),
        ));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(CorralError::Validation(format!(
            "instance name '{name}' is longer than {MAX_NAME_LEN} characters"
        )));
    }
    let mut chars = name.chars();
    let first_ok = chars.next().is_some_and(|c| c.is_ascii_alphabetic());
    let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !first_ok || !rest_ok {
        return Err(CorralError::Validation(format!(
            "instance name '{name}' must start with a letter and contain only letters, digits, '_' or '-'"
        )));
    }
    Ok(())
}

pub fn validate_port(port: u32) -> Result<u16, CorralError> {
    if port == 0 || port > u32::from(u16::MAX) {
        return Err(CorralError::Validation(format!(
            "port {port} is outside 1-65535"
        )));
    }
    Ok(port as u16)
}

pub fn validate_disk_size(size: &str) -> Result<(), CorralError> {
    disk_size_mb(size).map(|_| ())
}

/// Parses `<digits>G` or `<digits>M` into megabytes.
pub fn disk_size_mb(size: &str) -> Result<u64, CorralError> {
    let invalid = || {
        CorralError::Validation(format!(
            "disk size '{size}' must be a number followed by G or M (e.g. 20G)"
        ))
    };
    let (digits, unit) = match size.strip_suffix('G') {
        Some(digits) => (digits, 1024),
        None => (size.strip_suffix('M').ok_or_else(invalid)?, 1),
    };
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    let value: u64 = digits.parse().map_err(|_| invalid())?;
    if value == 0 {
        return Err(CorralError::Validation(format!(
            "disk size '{size}' must be greater than zero"
        )));
    }
    value.checked_mul(unit).ok_or_else(invalid)
}

pub fn validate_username(username: &str) -> Result<(), CorralError> {
    let mut chars = username.chars();
    let first_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_');
    let rest_ok = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
    if !first_ok || !rest_ok || username.len() > MAX_USERNAME_LEN {
        return Err(CorralError::Validation(format!(
            "username '{username}' must start with a lowercase letter or '_', use only [a-z0-9_-], and be at most {MAX_USERNAME_LEN} characters"
        )));
    }
    if username == "root" {
        return Err(CorralError::Validation(
            "username 'root' is reserved; pick an unprivileged login".to_string(),
        ));
    }
    Ok(())
}

pub fn validate_password(password: &str) -> Result<(), CorralError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(CorralError::Validation(format!(
            "password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    if password.contains(['\n', '\r', ':']) {
        return Err(CorralError::Validation(
            "password must not contain newlines or ':'".to_string(),
        ));
    }
    Ok(())
}

pub fn validate_memory(memory_mb: u32) -> Result<(), CorralError> {
    if memory_mb < MIN_MEMORY_MB {
        return Err(CorralError::Validation(format!(
            "memory must be at least {MIN_MEMORY_MB} MB (got {memory_mb})"
        )));
    }
    Ok(())
}

pub fn validate_cpus(cpus: u32) -> Result<(), CorralError> {
    if cpus == 0 || cpus > MAX_CPUS {
        return Err(CorralError::Validation(format!(
            "cpu count must be between 1 and {MAX_CPUS} (got {cpus})"
        )));
    }
    Ok(())
}

pub fn generate_password() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(GENERATED_PASSWORD_LEN)
        .map(char::from)
        .collect()
}

#[cfg(test)]
pub(crate) fn sample_spec(name: &str, backend: Backend, ssh_port: u16) -> InstanceSpec {
    InstanceSpec {
        name: name.to_string(),
        backend,
        os: OsProfile {
            name: "ubuntu".to_string(),
            version: "jammy".to_string(),
            source: "https://cloud-images.ubuntu.com/jammy/current/jammy-server-cloudimg-amd64.img"
                .to_string(),
        },
        resources: Resources {
            memory_mb: DEFAULT_MEMORY_MB,
            cpus: DEFAULT_CPUS,
            disk_size: DEFAULT_DISK_SIZE.to_string(),
        },
        network: Network {
            ssh_port,
            forwards: Vec::new(),
        },
        credentials: Credentials {
            username: DEFAULT_USERNAME.to_string(),
            password: "correct-horse".to_string(),
        },
        display: false,
        root_wrapper: None,
        created_at: DateTime::parse_from_rfc3339("2026-01-02T03:04:05Z")
            .map(|ts| ts.with_timezone(&Utc))
            .unwrap(),
    }
}

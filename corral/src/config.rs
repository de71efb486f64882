use crate::error::CorralError;
use crate::instance::{validate_name, validate_port, Backend};
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_YAML: &str = include_str!("../config/default.yaml");
pub const CONFIG_VERSION: u32 = 1;
pub const MAX_STOP_GRACE_SECS: u64 = 300;

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub version: u32,
    pub paths: Paths,
    pub tools: Tools,
    pub vm: VmSettings,
    pub supervisor: SupervisorSettings,
    pub profiles: BTreeMap<String, Profile>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct Paths {
    pub state_dir: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct Tools {
    pub qemu_system: String,
    pub qemu_img: String,
    pub container_engine: String,
    pub seed_builder: SeedBuilder,
    pub root_wrapper: RootWrapper,
    pub openssl: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SeedBuilder {
    CloudLocalds,
    Genisoimage,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RootWrapper {
    Proot,
    Fakeroot,
}

impl RootWrapper {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Proot => "proot",
            Self::Fakeroot => "fakeroot",
        }
    }
}

impl std::str::FromStr for RootWrapper {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "proot" => Ok(Self::Proot),
            "fakeroot" => Ok(Self::Fakeroot),
            other => Err(format!("unknown root wrapper '{other}'; expected proot or fakeroot")),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct VmSettings {
    pub machine: String,
    pub display: String,
    pub cloud_init: bool,
    pub guest_ssh_port: u16,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct SupervisorSettings {
    pub stop_grace_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Profile {
    pub name: String,
    pub version: String,
    pub image_url: String,
    pub container_image: String,
    pub rootfs_url: String,
}

impl Profile {
    /// Where a backend gets its guest from: a cloud image, an image
    /// reference, or a root filesystem tarball.
    pub fn source_for(&self, backend: Backend) -> &str {
        match backend {
            Backend::Vm => &self.image_url,
            Backend::Container => &self.container_image,
            Backend::RootEmulation => &self.rootfs_url,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            paths: Paths::default(),
            tools: Tools::default(),
            vm: VmSettings::default(),
            supervisor: SupervisorSettings::default(),
            profiles: default_profiles(),
        }
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            state_dir: "~/.local/share/corral".to_string(),
        }
    }
}

impl Default for Tools {
    fn default() -> Self {
        Self {
            qemu_system: "qemu-system-x86_64".to_string(),
            qemu_img: "qemu-img".to_string(),
            container_engine: "docker".to_string(),
            seed_builder: SeedBuilder::CloudLocalds,
            root_wrapper: RootWrapper::Proot,
            openssl: "openssl".to_string(),
        }
    }
}

impl Default for VmSettings {
    fn default() -> Self {
        Self {
            machine: "q35".to_string(),
            display: "gtk".to_string(),
            cloud_init: true,
            guest_ssh_port: 22,
        }
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self { stop_grace_secs: 5 }
    }
}

fn default_profiles() -> BTreeMap<String, Profile> {
    let mut profiles = BTreeMap::new();
    profiles.insert(
        "ubuntu-jammy".to_string(),
        Profile {
            name: "ubuntu".to_string(),
            version: "jammy".to_string(),
            image_url: "https://cloud-images.ubuntu.com/jammy/current/jammy-server-cloudimg-amd64.img".to_string(),
            container_image: "ubuntu:22.04".to_string(),
            rootfs_url: "https://cloud-images.ubuntu.com/jammy/current/jammy-server-cloudimg-amd64-root.tar.xz".to_string(),
        },
    );
    profiles.insert(
        "ubuntu-noble".to_string(),
        Profile {
            name: "ubuntu".to_string(),
            version: "noble".to_string(),
            image_url: "https://cloud-images.ubuntu.com/noble/current/noble-server-cloudimg-amd64.img".to_string(),
            container_image: "ubuntu:24.04".to_string(),
            rootfs_url: "https://cloud-images.ubuntu.com/noble/current/noble-server-cloudimg-amd64-root.tar.xz".to_string(),
        },
    );
    profiles.insert(
        "debian-bookworm".to_string(),
        Profile {
            name: "debian".to_string(),
            version: "bookworm".to_string(),
            image_url: "https://cloud.debian.org/images/cloud/bookworm/latest/debian-12-generic-amd64.qcow2".to_string(),
            container_image: "debian:bookworm".to_string(),
            rootfs_url: String::new(),
        },
    );
    profiles
}

pub fn read_config_from_str(content: &str) -> Result<Config, CorralError> {
    let cfg: Config = serde_yaml::from_str(content)?;
    if cfg.version != CONFIG_VERSION {
        return Err(CorralError::Config(format!(
            "unsupported config version {}",
            cfg.version
        )));
    }
    validate_config(&cfg)?;
    Ok(cfg)
}

pub fn read_config(path: &Path) -> Result<Config, CorralError> {
    let content = fs::read_to_string(path)?;
    read_config_from_str(&content)
}

/// A missing config file means built-in defaults; a present one must be valid.
pub fn load_config(path: &Path) -> Result<Config, CorralError> {
    if path.exists() {
        read_config(path)
    } else {
        Ok(Config::default())
    }
}

pub fn validate_config(cfg: &Config) -> Result<(), CorralError> {
    if cfg.paths.state_dir.trim().is_empty() {
        return Err(CorralError::Config(
            "paths.state_dir must be non-empty".to_string(),
        ));
    }
    let tools = [
        ("tools.qemu_system", &cfg.tools.qemu_system),
        ("tools.qemu_img", &cfg.tools.qemu_img),
        ("tools.container_engine", &cfg.tools.container_engine),
        ("tools.openssl", &cfg.tools.openssl),
        ("vm.machine", &cfg.vm.machine),
        ("vm.display", &cfg.vm.display),
    ];
    for (field, value) in tools {
        if value.trim().is_empty() {
            return Err(CorralError::Config(format!("{field} must be non-empty")));
        }
    }
    validate_port(u32::from(cfg.vm.guest_ssh_port))
        .map_err(|_| CorralError::Config("vm.guest_ssh_port must be 1-65535".to_string()))?;
    if cfg.supervisor.stop_grace_secs > MAX_STOP_GRACE_SECS {
        return Err(CorralError::Config(format!(
            "supervisor.stop_grace_secs must be at most {MAX_STOP_GRACE_SECS}"
        )));
    }
    if cfg.profiles.is_empty() {
        return Err(CorralError::Config(
            "config.profiles must contain at least one profile".to_string(),
        ));
    }
    for (id, profile) in &cfg.profiles {
        validate_name(id)
            .map_err(|_| CorralError::Config(format!("profiles.{id}: invalid profile id")))?;
        if profile.name.trim().is_empty() || profile.version.trim().is_empty() {
            return Err(CorralError::Config(format!(
                "profiles.{id}.name and profiles.{id}.version must be non-empty"
            )));
        }
        if profile.image_url.trim().is_empty()
            && profile.container_image.trim().is_empty()
            && profile.rootfs_url.trim().is_empty()
        {
            return Err(CorralError::Config(format!(
                "profiles.{id} needs at least one of image_url, container_image, rootfs_url"
            )));
        }
    }
    Ok(())
}

pub fn expand_path(input: &str) -> PathBuf {
    let trimmed = input.trim();
    if trimmed == "~" {
        if let Some(home) = home_dir() {
            return home;
        }
    }
    if let Some(stripped) = trimmed.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(trimmed)
}

pub fn default_config_dir() -> PathBuf {
    if let Ok(path) = env::var("CORRAL_CONFIG_DIR") {
        return PathBuf::from(path);
    }
    let mut base = home_dir().unwrap_or_else(|| PathBuf::from("."));
    base.push(".config");
    base.push("corral");
    base
}

pub fn resolve_config_path(override_path: Option<&PathBuf>) -> PathBuf {
    if let Some(path) = override_path {
        return path.clone();
    }
    if let Ok(path) = env::var("CORRAL_CONFIG") {
        return PathBuf::from(path);
    }
    default_config_dir().join("config.yaml")
}

pub fn resolve_state_dir(cfg: &Config) -> PathBuf {
    if let Ok(path) = env::var("CORRAL_STATE_DIR") {
        if !path.trim().is_empty() {
            return expand_path(&path);
        }
    }
    expand_path(&cfg.paths.state_dir)
}

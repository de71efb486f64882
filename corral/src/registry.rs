//! File-backed instance registry.
//!
//! One `key=value` record per instance lives at `<state_dir>/instances/<name>.conf`
//! so an operator can read or hand-edit it; the instance's artifacts sit next to it
//! in `<state_dir>/instances/<name>/`. Absent keys fall back to the defaults below
//! instead of failing the load.

use crate::config::RootWrapper;
use crate::error::CorralError;
use crate::instance::{
    validate_name, Backend, Credentials, InstancePaths, InstanceSpec, Network, OsProfile,
    PortForward, Resources, DEFAULT_CPUS, DEFAULT_DISK_SIZE, DEFAULT_MEMORY_MB, DEFAULT_SSH_PORT,
    DEFAULT_USERNAME,
};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

const RECORD_EXTENSION: &str = "conf";

#[derive(Debug, Clone)]
pub struct Registry {
    state_dir: PathBuf,
}

impl Registry {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn instances_dir(&self) -> PathBuf {
        self.state_dir.join("instances")
    }

    pub fn record_path(&self, name: &str) -> PathBuf {
        self.instances_dir()
            .join(format!("{name}.{RECORD_EXTENSION}"))
    }

    pub fn paths(&self, name: &str) -> InstancePaths {
        InstancePaths::derive(&self.state_dir, name)
    }

    pub fn exists(&self, name: &str) -> bool {
        validate_name(name).is_ok() && self.record_path(name).is_file()
    }

    pub fn list(&self) -> Result<Vec<String>, CorralError> {
        let dir = self.instances_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut names = BTreeSet::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            if validate_name(stem).is_ok() && path.is_file() {
                names.insert(stem.to_string());
            }
        }
        Ok(names.into_iter().collect())
    }

    /// Names that could not have been created (path separators, `..`) are
    /// never resolved to a file.
    pub fn load(&self, name: &str) -> Result<InstanceSpec, CorralError> {
        if validate_name(name).is_err() {
            return Err(CorralError::NotFound(name.to_string()));
        }
        let path = self.record_path(name);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(CorralError::NotFound(name.to_string()));
            }
            Err(err) => return Err(err.into()),
        };
        let fallback_created = fs::metadata(&path)
            .and_then(|meta| meta.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        parse_record(name, &text, fallback_created)
    }

    pub fn load_all(&self) -> Result<Vec<InstanceSpec>, CorralError> {
        self.list()?
            .iter()
            .map(|name| self.load(name))
            .collect()
    }

    pub fn save(&self, spec: &InstanceSpec) -> Result<(), CorralError> {
        write_atomic_text_file(&self.record_path(&spec.name), &render_record(spec), Some(0o600))
    }

    /// Removes the artifact directory first so a failed removal keeps the record visible.
    pub fn remove(&self, name: &str) -> Result<(), CorralError> {
        if !self.exists(name) {
            return Err(CorralError::NotFound(name.to_string()));
        }
        let paths = self.paths(name);
        match fs::remove_dir_all(&paths.instance_dir) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        match fs::remove_file(self.record_path(name)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(CorralError::NotFound(name.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }
}

pub fn render_record(spec: &InstanceSpec) -> String {
    let forwards = spec
        .network
        .forwards
        .iter()
        .map(PortForward::to_string)
        .collect::<Vec<_>>()
        .join(",");
    let fields: [(&str, String); 15] = [
        ("name", spec.name.clone()),
        ("backend", spec.backend.as_str().to_string()),
        ("os_name", spec.os.name.clone()),
        ("os_version", spec.os.version.clone()),
        ("os_source", spec.os.source.clone()),
        ("memory_mb", spec.resources.memory_mb.to_string()),
        ("cpus", spec.resources.cpus.to_string()),
        ("disk_size", spec.resources.disk_size.clone()),
        ("ssh_port", spec.network.ssh_port.to_string()),
        ("port_forwards", forwards),
        ("username", spec.credentials.username.clone()),
        ("password", spec.credentials.password.clone()),
        ("display", spec.display.to_string()),
        (
            "root_wrapper",
            spec.root_wrapper
                .map(|wrapper| wrapper.as_str().to_string())
                .unwrap_or_default(),
        ),
        ("created_at", spec.created_at.to_rfc3339()),
    ];
    let mut out = format!("# corral instance record for '{}'\n", spec.name);
    for (key, value) in fields {
        out.push_str(key);
        out.push_str("=\"");
        out.push_str(&value);
        out.push_str("\"\n");
    }
    out
}

fn unquote(raw: &str) -> &str {
    let trimmed = raw.trim();
    for quote in ['"', '\''] {
        if trimmed.len() >= 2 && trimmed.starts_with(quote) && trimmed.ends_with(quote) {
            return &trimmed[1..trimmed.len() - 1];
        }
    }
    trimmed
}

pub fn parse_record(
    name: &str,
    text: &str,
    fallback_created: DateTime<Utc>,
) -> Result<InstanceSpec, CorralError> {
    let mut values: BTreeMap<&str, &str> = BTreeMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        values.insert(key.trim(), unquote(value));
    }
    let invalid = |key: &str, value: &str| CorralError::Record {
        name: name.to_string(),
        message: format!("{key}='{value}' could not be parsed"),
    };
    let text_or = |key: &str, default: &str| -> String {
        values
            .get(key)
            .filter(|value| !value.is_empty())
            .map_or_else(|| default.to_string(), |value| value.to_string())
    };
    fn number_or<T: std::str::FromStr>(
        values: &BTreeMap<&str, &str>,
        key: &str,
        default: T,
    ) -> Result<T, (String, String)> {
        match values.get(key).filter(|value| !value.is_empty()) {
            None => Ok(default),
            Some(value) => value
                .parse()
                .map_err(|_| (key.to_string(), value.to_string())),
        }
    }
    let numeric = |result: Result<u32, (String, String)>| {
        result.map_err(|(key, value)| invalid(&key, &value))
    };

    if let Some(stored) = values.get("name") {
        if !stored.is_empty() && *stored != name {
            tracing::warn!(
                instance = name,
                stored_name = *stored,
                "record name differs from its file name; using the file name"
            );
        }
    }

    let backend = match values.get("backend").filter(|value| !value.is_empty()) {
        None => Backend::Vm,
        Some(value) => value.parse().map_err(|_| invalid("backend", *value))?,
    };
    let ssh_port = numeric(number_or(&values, "ssh_port", u32::from(DEFAULT_SSH_PORT)))?;
    let ssh_port = u16::try_from(ssh_port)
        .ok()
        .filter(|port| *port != 0)
        .ok_or_else(|| invalid("ssh_port", &ssh_port.to_string()))?;
    let forwards = match values.get("port_forwards") {
        None => Vec::new(),
        Some(raw) => raw
            .split(',')
            .map(str::trim)
            .filter(|rule| !rule.is_empty())
            .map(|rule| {
                rule.parse::<PortForward>()
                    .map_err(|_| invalid("port_forwards", *raw))
            })
            .collect::<Result<Vec<_>, _>>()?,
    };
    let display = match values.get("display").filter(|value| !value.is_empty()) {
        None => false,
        Some(value) => match value.to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" | "on" => true,
            "false" | "no" | "0" | "off" => false,
            _ => return Err(invalid("display", *value)),
        },
    };
    let root_wrapper = match values.get("root_wrapper").filter(|value| !value.is_empty()) {
        None => None,
        Some(value) => Some(
            value
                .parse::<RootWrapper>()
                .map_err(|_| invalid("root_wrapper", *value))?,
        ),
    };
    let created_at = match values.get("created_at").filter(|value| !value.is_empty()) {
        None => fallback_created,
        Some(value) => DateTime::parse_from_rfc3339(value)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|_| invalid("created_at", *value))?,
    };

    Ok(InstanceSpec {
        name: name.to_string(),
        backend,
        os: OsProfile {
            name: text_or("os_name", ""),
            version: text_or("os_version", ""),
            source: text_or("os_source", ""),
        },
        resources: Resources {
            memory_mb: numeric(number_or(&values, "memory_mb", DEFAULT_MEMORY_MB))?,
            cpus: numeric(number_or(&values, "cpus", DEFAULT_CPUS))?,
            disk_size: text_or("disk_size", DEFAULT_DISK_SIZE),
        },
        network: Network { ssh_port, forwards },
        credentials: Credentials {
            username: text_or("username", DEFAULT_USERNAME),
            password: values.get("password").map(|p| p.to_string()).unwrap_or_default(),
        },
        display,
        root_wrapper,
        created_at,
    })
}

pub fn ensure_parent(path: &Path) -> Result<(), CorralError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Writes `content` beside `path` and renames it into place, so readers see
/// either the old file or the new one.
pub fn write_atomic_text_file(
    path: &Path,
    content: &str,
    mode: Option<u32>,
) -> Result<(), CorralError> {
    ensure_parent(path)?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut staged = tempfile::Builder::new()
        .prefix(".corral-")
        .suffix(".tmp")
        .tempfile_in(dir)?;
    staged.write_all(content.as_bytes())?;
    staged.as_file().sync_all()?;
    // Staged files start at 0600; plain writes get the usual 0644.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = mode.unwrap_or(0o644);
        staged
            .as_file()
            .set_permissions(fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = mode;
    staged.persist(path).map_err(|err| err.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::sample_spec;
    use tempfile::tempdir;

    #[test]
    fn save_then_load_returns_the_same_spec() {
        let dir = tempdir().unwrap();
        let registry = Registry::new(dir.path());
        let mut spec = sample_spec("web", Backend::Vm, 2222);
        spec.network.forwards = vec![PortForward { host: 8080, guest: 80 }];
        spec.display = true;
        spec.root_wrapper = Some(RootWrapper::Fakeroot);
        registry.save(&spec).unwrap();

        assert!(registry.exists("web"));
        assert_eq!(registry.load("web").unwrap(), spec);
    }

    #[test]
    fn missing_fields_resolve_to_defaults() {
        let created = Utc::now();
        let spec = parse_record("bare", "# hand written\nbackend=container\n", created).unwrap();
        assert_eq!(spec.name, "bare");
        assert_eq!(spec.backend, Backend::Container);
        assert_eq!(spec.resources.memory_mb, 2048);
        assert_eq!(spec.resources.cpus, 2);
        assert_eq!(spec.resources.disk_size, "20G");
        assert_eq!(spec.network.ssh_port, 2222);
        assert!(spec.network.forwards.is_empty());
        assert_eq!(spec.credentials.username, "user");
        assert!(!spec.display);
        assert_eq!(spec.root_wrapper, None);
        assert_eq!(spec.created_at, created);
    }

    #[test]
    fn hand_edited_values_without_quotes_are_accepted() {
        let text = "memory_mb=4096\ncpus = 4\nport_forwards=8080:80, 9000:9000\ndisplay=yes\nusername='dev'\n";
        let spec = parse_record("dev", text, Utc::now()).unwrap();
        assert_eq!(spec.resources.memory_mb, 4096);
        assert_eq!(spec.resources.cpus, 4);
        assert_eq!(spec.network.forwards.len(), 2);
        assert!(spec.display);
        assert_eq!(spec.credentials.username, "dev");
    }

    #[test]
    fn unparseable_values_are_record_errors() {
        let err = parse_record("web", "memory_mb=lots\n", Utc::now()).unwrap_err();
        assert!(matches!(err, CorralError::Record { .. }));
        let err = parse_record("web", "ssh_port=70000\n", Utc::now()).unwrap_err();
        assert!(matches!(err, CorralError::Record { .. }));
        let err = parse_record("web", "backend=lxc\n", Utc::now()).unwrap_err();
        assert!(matches!(err, CorralError::Record { .. }));
        let err = parse_record("web", "root_wrapper=chroot\n", Utc::now()).unwrap_err();
        assert!(matches!(err, CorralError::Record { .. }));
    }

    #[test]
    fn list_is_sorted_and_ignores_foreign_files() {
        let dir = tempdir().unwrap();
        let registry = Registry::new(dir.path());
        for (name, port) in [("zeta", 2301), ("alpha", 2302), ("mid", 2303)] {
            registry.save(&sample_spec(name, Backend::Vm, port)).unwrap();
        }
        fs::write(registry.instances_dir().join("notes.txt"), "x").unwrap();
        fs::create_dir_all(registry.paths("alpha").instance_dir).unwrap();

        assert_eq!(registry.list().unwrap(), vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn list_of_missing_state_dir_is_empty() {
        let dir = tempdir().unwrap();
        let registry = Registry::new(dir.path().join("nope"));
        assert!(registry.list().unwrap().is_empty());
    }

    #[test]
    fn load_of_unknown_instance_is_not_found() {
        let dir = tempdir().unwrap();
        let registry = Registry::new(dir.path());
        assert!(matches!(
            registry.load("ghost"),
            Err(CorralError::NotFound(name)) if name == "ghost"
        ));
    }

    #[test]
    fn path_like_names_are_not_found() {
        let dir = tempdir().unwrap();
        let registry = Registry::new(dir.path());
        registry.save(&sample_spec("web", Backend::Vm, 2222)).unwrap();
        fs::create_dir_all(registry.paths("web").instance_dir).unwrap();

        for name in ["web/../web", "../instances/web", "x/../web"] {
            assert!(!registry.exists(name));
            assert!(matches!(registry.load(name), Err(CorralError::NotFound(_))));
            assert!(matches!(registry.remove(name), Err(CorralError::NotFound(_))));
        }
        assert!(registry.exists("web"));
        assert!(registry.paths("web").instance_dir.is_dir());
    }

    #[test]
    fn remove_deletes_record_and_artifacts() {
        let dir = tempdir().unwrap();
        let registry = Registry::new(dir.path());
        registry.save(&sample_spec("web", Backend::Vm, 2222)).unwrap();
        let paths = registry.paths("web");
        fs::create_dir_all(&paths.instance_dir).unwrap();
        fs::write(&paths.disk_image, "disk").unwrap();

        registry.remove("web").unwrap();
        assert!(!registry.exists("web"));
        assert!(!paths.instance_dir.exists());
        assert!(matches!(registry.remove("web"), Err(CorralError::NotFound(_))));
    }

    #[cfg(unix)]
    #[test]
    fn records_are_private_to_the_owner() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let registry = Registry::new(dir.path());
        registry.save(&sample_spec("web", Backend::Vm, 2222)).unwrap();
        let mode = fs::metadata(registry.record_path("web"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn atomic_write_replaces_existing_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("file.txt");
        write_atomic_text_file(&path, "one", None).unwrap();
        write_atomic_text_file(&path, "two", None).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "two");
        let leftovers = fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[cfg(unix)]
    #[test]
    fn atomic_write_applies_requested_mode() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let secret = dir.path().join("secret.conf");
        let plain = dir.path().join("plain.yaml");
        write_atomic_text_file(&secret, "k=\"v\"\n", Some(0o600)).unwrap();
        write_atomic_text_file(&plain, "version: 1\n", None).unwrap();
        let mode_of = |p: &Path| fs::metadata(p).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode_of(&secret), 0o600);
        assert_eq!(mode_of(&plain), 0o644);
    }
}

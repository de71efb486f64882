use assert_cmd::Command;
use predicates::str::contains;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::tempdir;

fn bin() -> Command {
    let path = assert_cmd::cargo::cargo_bin!("corral");
    let mut cmd = Command::new(path);
    cmd.env_remove("CORRAL_STATE_DIR")
        .env_remove("CORRAL_CONFIG")
        .env_remove("CORRAL_LOG");
    cmd
}

fn parse_json(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes).expect("json output")
}

/// Config whose rootfs backend uses fakeroot, so instances need no downloads
/// or external engines.
fn write_config(root: &Path) -> PathBuf {
    let state_dir = root.join("state");
    let config_path = root.join("config.yaml");
    fs::write(
        &config_path,
        format!(
            "version: 1\npaths:\n  state_dir: {}\ntools:\n  root_wrapper: fakeroot\nsupervisor:\n  stop_grace_secs: 0\n",
            state_dir.display()
        ),
    )
    .unwrap();
    config_path
}

fn corral(config: &Path, args: &[&str]) -> Command {
    let mut cmd = bin();
    cmd.arg("--json").arg("--config").arg(config).args(args);
    cmd
}

fn create_sandbox(config: &Path, name: &str, port: &str) -> Value {
    let output = corral(
        config,
        &[
            "create",
            name,
            "--backend",
            "rootfs",
            "--port",
            port,
            "--password",
            "correct-horse",
        ],
    )
    .assert()
    .success()
    .get_output()
    .stdout
    .clone();
    parse_json(&output)
}

fn failure_kind(config: &Path, args: &[&str]) -> String {
    let output = corral(config, args).assert().failure().get_output().stdout.clone();
    let json = parse_json(&output);
    assert_eq!(json["ok"], false);
    json["error_kind"].as_str().unwrap_or_default().to_string()
}

#[test]
fn config_init_creates_and_preserves_existing() {
    let dir = tempdir().unwrap();
    let config_dir = dir.path().join("config");

    let output = bin()
        .env("CORRAL_CONFIG_DIR", &config_dir)
        .arg("--json")
        .arg("config")
        .arg("init")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json = parse_json(&output);
    assert_eq!(json["result"]["created"], true);
    let config_path = config_dir.join("config.yaml");
    let written = fs::read_to_string(&config_path).unwrap();
    assert!(written.contains("ubuntu-jammy"));

    fs::write(&config_path, "version: 1\n").unwrap();
    let output = bin()
        .env("CORRAL_CONFIG_DIR", &config_dir)
        .arg("--json")
        .arg("config")
        .arg("init")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    assert_eq!(parse_json(&output)["result"]["created"], false);
    assert_eq!(fs::read_to_string(&config_path).unwrap(), "version: 1\n");
}

#[test]
fn config_validate_reports_unknown_keys() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("config.yaml");
    fs::write(&config_path, "version: 1\nsurprise: true\n").unwrap();
    assert_eq!(failure_kind(&config_path, &["config", "validate"]), "config");
}

#[test]
fn config_validate_accepts_written_config() {
    let dir = tempdir().unwrap();
    let config = write_config(dir.path());
    corral(&config, &["config", "validate"])
        .assert()
        .success()
        .stdout(contains("\"valid\": true"));
}

#[test]
fn create_then_list_and_describe() {
    let dir = tempdir().unwrap();
    let config = write_config(dir.path());

    let created = create_sandbox(&config, "web", "2222");
    assert_eq!(created["result"]["name"], "web");
    assert_eq!(created["result"]["backend"], "rootfs");
    assert!(created["result"].get("generated_password").is_none());
    assert!(dir.path().join("state/instances/web.conf").exists());

    let output = corral(&config, &["list"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let list = parse_json(&output);
    let instances = list["result"]["instances"].as_array().unwrap();
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0]["name"], "web");
    assert_eq!(instances[0]["status"], "stopped");

    let output = corral(&config, &["describe", "web"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let view = parse_json(&output);
    assert_eq!(view["result"]["network"]["ssh_port"], 2222);
    assert_eq!(view["result"]["resources"]["memory_mb"], 2048);
    assert_eq!(view["result"]["credentials"]["username"], "user");
    assert_eq!(view["result"]["credentials"]["password"], "********");
    assert_eq!(view["result"]["status"], "stopped");

    let output = corral(&config, &["describe", "web", "--show-password"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    assert_eq!(
        parse_json(&output)["result"]["credentials"]["password"],
        "correct-horse"
    );
}

#[test]
fn duplicate_names_and_ports_conflict() {
    let dir = tempdir().unwrap();
    let config = write_config(dir.path());
    create_sandbox(&config, "web", "2222");

    let create = |name: &str, port: &str| {
        failure_kind(
            &config,
            &["create", name, "--backend", "rootfs", "--port", port, "--password", "correct-horse"],
        )
    };
    assert_eq!(create("web", "2300"), "conflict");
    assert_eq!(create("web2", "2222"), "conflict");

    create_sandbox(&config, "web2", "2223");
    let output = corral(&config, &["list"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let names: Vec<String> = parse_json(&output)["result"]["instances"]
        .as_array()
        .unwrap()
        .iter()
        .map(|entry| entry["name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(names, vec!["web", "web2"]);
}

#[test]
fn invalid_input_is_a_validation_error() {
    let dir = tempdir().unwrap();
    let config = write_config(dir.path());
    assert_eq!(
        failure_kind(&config, &["create", "9web", "--backend", "rootfs", "--password", "correct-horse"]),
        "validation"
    );
    assert_eq!(
        failure_kind(&config, &["create", "web", "--backend", "rootfs", "--password", "short"]),
        "validation"
    );
    assert_eq!(
        failure_kind(&config, &["create", "web", "--backend", "rootfs", "--password", "correct-horse", "--disk", "20T"]),
        "validation"
    );
    assert!(!dir.path().join("state/instances/web.conf").exists());
}

#[test]
fn missing_password_is_generated_and_reported() {
    let dir = tempdir().unwrap();
    let config = write_config(dir.path());
    let output = corral(&config, &["create", "web", "--backend", "rootfs"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let generated = parse_json(&output)["result"]["generated_password"]
        .as_str()
        .unwrap()
        .to_string();
    assert_eq!(generated.len(), 16);
    assert!(generated.chars().all(|c| c.is_ascii_alphanumeric()));
}

#[test]
fn edit_updates_record_and_checks_ports() {
    let dir = tempdir().unwrap();
    let config = write_config(dir.path());
    create_sandbox(&config, "web", "2222");
    create_sandbox(&config, "api", "2223");

    let output = corral(
        &config,
        &["edit", "web", "--memory", "4096", "--forward", "8080:80", "--display"],
    )
    .assert()
    .success()
    .get_output()
    .stdout
    .clone();
    let edited = parse_json(&output);
    assert_eq!(edited["result"]["memory_mb"], 4096);
    assert_eq!(edited["result"]["port_forwards"][0], "8080:80");
    assert_eq!(edited["result"]["display"], true);

    let record = fs::read_to_string(dir.path().join("state/instances/web.conf")).unwrap();
    assert!(record.contains("memory_mb=\"4096\""));

    assert_eq!(failure_kind(&config, &["edit", "web", "--port", "2223"]), "conflict");
    assert_eq!(failure_kind(&config, &["edit", "api", "--forward", "8080:80"]), "conflict");
    assert_eq!(failure_kind(&config, &["edit", "web"]), "validation");
}

#[test]
fn delete_requires_confirmation_sentinel() {
    let dir = tempdir().unwrap();
    let config = write_config(dir.path());
    create_sandbox(&config, "web", "2222");

    assert_eq!(failure_kind(&config, &["delete", "web"]), "precondition");
    assert_eq!(
        failure_kind(&config, &["delete", "web", "--confirm", "yes"]),
        "precondition"
    );
    assert!(dir.path().join("state/instances/web.conf").exists());

    corral(&config, &["delete", "web", "--confirm", "DELETE"])
        .assert()
        .success()
        .stdout(contains("\"deleted\": true"));
    assert!(!dir.path().join("state/instances/web.conf").exists());
    assert!(!dir.path().join("state/instances/web").exists());

    create_sandbox(&config, "again", "2222");
}

#[test]
fn unknown_instance_is_not_found() {
    let dir = tempdir().unwrap();
    let config = write_config(dir.path());
    assert_eq!(failure_kind(&config, &["describe", "ghost"]), "not_found");
    assert_eq!(failure_kind(&config, &["stop", "ghost"]), "not_found");
}

#[test]
fn rootfs_resize_is_unsupported_and_keeps_size() {
    let dir = tempdir().unwrap();
    let config = write_config(dir.path());
    create_sandbox(&config, "web", "2222");

    let output = corral(&config, &["resize", "web", "30G"])
        .assert()
        .failure()
        .get_output()
        .stdout
        .clone();
    let json = parse_json(&output);
    assert_eq!(json["error_kind"], "backend");
    assert_eq!(json["error_details"]["error_code"], "backend_unsupported");

    let output = corral(&config, &["describe", "web"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    assert_eq!(parse_json(&output)["result"]["resources"]["disk_size"], "20G");
}

#[test]
fn stop_on_stopped_instance_reports_not_running() {
    let dir = tempdir().unwrap();
    let config = write_config(dir.path());
    create_sandbox(&config, "web", "2222");
    for _ in 0..2 {
        let output = corral(&config, &["stop", "web"])
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        assert_eq!(parse_json(&output)["result"]["stop"]["outcome"], "not_running");
    }
}

#[test]
fn paths_reflect_state_dir_override() {
    let dir = tempdir().unwrap();
    let config = write_config(dir.path());
    let override_dir = dir.path().join("elsewhere");
    let output = corral(&config, &["paths"])
        .env("CORRAL_STATE_DIR", &override_dir)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json = parse_json(&output);
    assert_eq!(json["result"]["state_dir"], override_dir.display().to_string());
    assert_eq!(json["result"]["config_exists"], true);
}

#[test]
fn profiles_lists_builtin_catalog() {
    let dir = tempdir().unwrap();
    let config = write_config(dir.path());
    let output = corral(&config, &["profiles"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json = parse_json(&output);
    let ids: Vec<&str> = json["result"]["profiles"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["debian-bookworm", "ubuntu-jammy", "ubuntu-noble"]);
}

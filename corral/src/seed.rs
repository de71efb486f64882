//! cloud-init seed for VM guests: user-data plus meta-data packaged into a
//! small ISO the VM boots with. Regenerated whenever credentials change.

use crate::backend::Toolchain;
use crate::config::SeedBuilder;
use crate::error::CorralError;
use crate::host::{execute, CommandLine, Host};
use crate::instance::{InstancePaths, InstanceSpec};
use chrono::Utc;
use serde::Serialize;
use std::fs;

pub const USER_DATA_FILE: &str = "user-data";
pub const META_DATA_FILE: &str = "meta-data";
const GUEST_PACKAGES: [&str; 2] = ["openssh-server", "qemu-guest-agent"];
const GUEST_SERVICES: [&str; 2] = ["ssh", "qemu-guest-agent"];

#[derive(Debug, Serialize)]
struct UserData<'a> {
    hostname: &'a str,
    users: Vec<GuestUser<'a>>,
    ssh_pwauth: bool,
    chpasswd: Chpasswd,
    package_update: bool,
    packages: Vec<&'static str>,
    runcmd: Vec<Vec<&'static str>>,
}

#[derive(Debug, Serialize)]
struct GuestUser<'a> {
    name: &'a str,
    sudo: &'static str,
    shell: &'static str,
    lock_passwd: bool,
    passwd: &'a str,
}

#[derive(Debug, Serialize)]
struct Chpasswd {
    list: String,
    expire: bool,
}

#[derive(Debug, Serialize)]
struct MetaData<'a> {
    #[serde(rename = "instance-id")]
    instance_id: String,
    #[serde(rename = "local-hostname")]
    local_hostname: &'a str,
}

pub fn render_user_data(spec: &InstanceSpec, password_hash: &str) -> Result<String, CorralError> {
    let username = spec.credentials.username.as_str();
    let doc = UserData {
        hostname: &spec.name,
        users: vec![GuestUser {
            name: username,
            sudo: "ALL=(ALL) NOPASSWD:ALL",
            shell: "/bin/bash",
            lock_passwd: false,
            passwd: password_hash,
        }],
        ssh_pwauth: true,
        chpasswd: Chpasswd {
            list: format!("{username}:{password_hash}"),
            expire: false,
        },
        package_update: true,
        packages: GUEST_PACKAGES.to_vec(),
        runcmd: GUEST_SERVICES
            .iter()
            .map(|service| vec!["systemctl", "enable", "--now", *service])
            .collect(),
    };
    Ok(format!("#cloud-config\n{}", serde_yaml::to_string(&doc)?))
}

/// `generation` goes into the instance-id so cloud-init treats each
/// regenerated seed as a new instance and re-applies it.
pub fn render_meta_data(spec: &InstanceSpec, generation: &str) -> Result<String, CorralError> {
    let doc = MetaData {
        instance_id: format!("corral-{}-{generation}", spec.name),
        local_hostname: &spec.name,
    };
    Ok(serde_yaml::to_string(&doc)?)
}

pub fn hash_password<H: Host + ?Sized>(
    host: &H,
    tools: &Toolchain,
    password: &str,
) -> Result<String, CorralError> {
    let command = CommandLine::new(tools.openssl.as_str()).args(["passwd", "-6", "-stdin"]);
    let input = format!("{password}\n");
    let output = execute(host, &command, Some(input.as_bytes()))?;
    let hash = output.stdout_text();
    if hash.is_empty() {
        return Err(CorralError::backend(format!(
            "`{}` produced no password hash",
            command.render()
        )));
    }
    Ok(hash)
}

fn package_command(tools: &Toolchain, paths: &InstancePaths, target: &str) -> CommandLine {
    let user_data = paths.seed_dir.join(USER_DATA_FILE).display().to_string();
    let meta_data = paths.seed_dir.join(META_DATA_FILE).display().to_string();
    match tools.seed_builder {
        SeedBuilder::CloudLocalds => CommandLine::new("cloud-localds")
            .arg(target)
            .arg(user_data)
            .arg(meta_data),
        SeedBuilder::Genisoimage => CommandLine::new("genisoimage")
            .arg("-output")
            .arg(target)
            .args(["-volid", "cidata", "-joliet", "-rock"])
            .arg(user_data)
            .arg(meta_data),
    }
}

/// Writes both documents and packages them. The image is built next to the
/// final path and renamed into place, so a failed rebuild keeps the old seed.
pub fn build_seed<H: Host + ?Sized>(
    host: &H,
    tools: &Toolchain,
    spec: &InstanceSpec,
    paths: &InstancePaths,
) -> Result<(), CorralError> {
    let hash = hash_password(host, tools, &spec.credentials.password)?;
    let generation = Utc::now().format("%Y%m%d%H%M%S").to_string();

    fs::create_dir_all(&paths.seed_dir)?;
    fs::write(
        paths.seed_dir.join(USER_DATA_FILE),
        render_user_data(spec, &hash)?,
    )?;
    fs::write(
        paths.seed_dir.join(META_DATA_FILE),
        render_meta_data(spec, &generation)?,
    )?;

    let staging = paths.seed_image.with_extension("iso.tmp");
    let _ = fs::remove_file(&staging);
    let command = package_command(tools, paths, &staging.display().to_string());
    if let Err(err) = execute(host, &command, None) {
        let _ = fs::remove_file(&staging);
        return Err(err);
    }
    fs::rename(&staging, &paths.seed_image)?;
    tracing::info!(instance = %spec.name, seed = %paths.seed_image.display(), "seed image written");
    Ok(())
}

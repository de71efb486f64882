mod allocator;
mod backend;
mod config;
mod error;
mod host;
mod instance;
mod lifecycle;
mod logging;
mod provision;
mod registry;
mod seed;
mod supervisor;

use crate::config::{
    load_config, read_config, resolve_config_path, resolve_state_dir, Config,
    SeedBuilder, DEFAULT_CONFIG_YAML,
};
use crate::error::{CorralError, ProcessErrorDetails};
use crate::host::SystemHost;
use crate::instance::{Backend, PortForward};
use crate::lifecycle::{Controller, InstanceDraft, InstancePatch, DELETE_CONFIRMATION};
use crate::registry::{write_atomic_text_file, Registry};
use clap::{Parser, Subcommand};
use dialoguer::theme::ColorfulTheme;
use dialoguer::{Input, Password};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::io::{self, IsTerminal};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "corral", version, about = "Manage persistent local VMs, containers and rootfs sandboxes")]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register and provision a new instance.
    Create {
        name: String,
        #[arg(long, default_value = "vm")]
        backend: Backend,
        #[arg(long, default_value = "ubuntu-jammy")]
        profile: String,
        #[arg(long)]
        memory: Option<u32>,
        #[arg(long)]
        cpus: Option<u32>,
        #[arg(long)]
        disk: Option<String>,
        #[arg(long)]
        port: Option<u32>,
        /// Extra HOST:GUEST forward; repeatable.
        #[arg(long = "forward")]
        forwards: Vec<PortForward>,
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        password: Option<String>,
        #[arg(long, default_value_t = false)]
        display: bool,
    },
    Start {
        name: String,
    },
    Stop {
        name: String,
    },
    Status {
        name: String,
    },
    List,
    Describe {
        name: String,
        #[arg(long, default_value_t = false)]
        show_password: bool,
    },
    /// Change settings of a stopped instance.
    Edit {
        name: String,
        #[arg(long)]
        memory: Option<u32>,
        #[arg(long)]
        cpus: Option<u32>,
        #[arg(long)]
        port: Option<u32>,
        /// Replaces all extra forwards; repeatable.
        #[arg(long = "forward", conflicts_with = "clear_forwards")]
        forwards: Vec<PortForward>,
        #[arg(long, default_value_t = false)]
        clear_forwards: bool,
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        password: Option<String>,
        #[arg(long, default_value_t = false, conflicts_with = "headless")]
        display: bool,
        #[arg(long, default_value_t = false)]
        headless: bool,
    },
    /// Grow the disk of a stopped instance.
    Resize {
        name: String,
        size: String,
    },
    Delete {
        name: String,
        /// Must be DELETE.
        #[arg(long)]
        confirm: Option<String>,
    },
    Profiles,
    Paths,
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    Init,
    Validate,
    Show,
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_kind: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_details: Option<ProcessErrorDetails>,
}

#[derive(Debug, Clone)]
struct Context {
    config_path: PathBuf,
    json: bool,
}

impl Context {
    fn interactive(&self) -> bool {
        !self.json && io::stdin().is_terminal()
    }
}

fn main() -> Result<(), CorralError> {
    logging::init();
    let cli = Cli::parse();
    let ctx = Context {
        config_path: resolve_config_path(cli.config.as_ref()),
        json: cli.json,
    };

    let result = match cli.command {
        Commands::Config { command } => handle_config(&ctx, command),
        Commands::Paths => handle_paths(&ctx),
        Commands::Profiles => handle_profiles(&ctx),
        command => handle_instance_command(&ctx, command),
    };

    if let Err(err) = result {
        if ctx.json {
            let payload = JsonResult::<serde_json::Value> {
                ok: false,
                result: None,
                error: Some(err.to_string()),
                error_kind: Some(err.kind()),
                error_details: err.details().cloned(),
            };
            print_json(&payload)?;
        } else {
            eprintln!("{err}");
        }
        std::process::exit(1);
    }

    Ok(())
}

fn handle_instance_command(ctx: &Context, command: Commands) -> Result<(), CorralError> {
    let cfg = load_config(&ctx.config_path)?;
    let state_dir = resolve_state_dir(&cfg);
    let host = SystemHost;
    let controller = Controller::new(cfg, state_dir, &host);

    match command {
        Commands::Create {
            name,
            backend,
            profile,
            memory,
            cpus,
            disk,
            port,
            forwards,
            username,
            password,
            display,
        } => {
            let password = match password {
                Some(password) => Some(password),
                None => prompt_password(ctx, &name)?,
            };
            let generated = password.is_none();
            let spec = controller.create(InstanceDraft {
                name,
                backend,
                profile,
                memory_mb: memory,
                cpus,
                disk_size: disk,
                ssh_port: port,
                forwards,
                username,
                password,
                display,
            })?;
            let mut payload = json!({
                "name": spec.name,
                "backend": spec.backend,
                "ssh_port": spec.network.ssh_port,
                "username": spec.credentials.username,
                "created_at": spec.created_at,
            });
            if generated {
                payload["generated_password"] = json!(spec.credentials.password);
            }
            output(ctx, payload)
        }
        Commands::Start { name } => {
            let outcome = controller.start(&name)?;
            output(ctx, json!({"name": name, "start": outcome}))
        }
        Commands::Stop { name } => {
            let outcome = controller.stop(&name)?;
            output(ctx, json!({"name": name, "stop": outcome}))
        }
        Commands::Status { name } => {
            let state = controller.status(&name)?;
            output(ctx, json!({"name": name, "status": state.label(), "pid": state.pid()}))
        }
        Commands::List => {
            let instances = controller.list()?;
            output(ctx, json!({"instances": instances}))
        }
        Commands::Describe {
            name,
            show_password,
        } => {
            let view = controller.describe(&name, show_password)?;
            output(ctx, serde_json::to_value(view)?)
        }
        Commands::Edit {
            name,
            memory,
            cpus,
            port,
            forwards,
            clear_forwards,
            username,
            password,
            display,
            headless,
        } => {
            let patch = InstancePatch {
                memory_mb: memory,
                cpus,
                ssh_port: port,
                forwards: if clear_forwards {
                    Some(Vec::new())
                } else if forwards.is_empty() {
                    None
                } else {
                    Some(forwards)
                },
                username,
                password,
                display: match (display, headless) {
                    (true, _) => Some(true),
                    (_, true) => Some(false),
                    _ => None,
                },
            };
            let spec = controller.edit(&name, patch)?;
            output(
                ctx,
                json!({
                    "name": spec.name,
                    "memory_mb": spec.resources.memory_mb,
                    "cpus": spec.resources.cpus,
                    "ssh_port": spec.network.ssh_port,
                    "port_forwards": spec.network.forwards.iter().map(ToString::to_string).collect::<Vec<_>>(),
                    "username": spec.credentials.username,
                    "display": spec.display,
                }),
            )
        }
        Commands::Resize { name, size } => {
            let spec = controller.resize(&name, &size)?;
            output(
                ctx,
                json!({"name": spec.name, "disk_size": spec.resources.disk_size}),
            )
        }
        Commands::Delete { name, confirm } => {
            let confirmation = match confirm {
                Some(value) => value,
                None => prompt_delete_confirmation(ctx, &name)?,
            };
            controller.delete(&name, &confirmation)?;
            output(ctx, json!({"name": name, "deleted": true}))
        }
        Commands::Config { .. } | Commands::Paths | Commands::Profiles => Err(
            CorralError::Validation("not an instance command".to_string()),
        ),
    }
}

/// Empty input on the prompt falls back to a generated password.
fn prompt_password(ctx: &Context, name: &str) -> Result<Option<String>, CorralError> {
    if !ctx.interactive() {
        return Ok(None);
    }
    let theme = ColorfulTheme::default();
    let password = Password::with_theme(&theme)
        .with_prompt(format!("Guest password for '{name}' (empty to generate)"))
        .with_confirmation("Confirm password", "Passwords do not match")
        .allow_empty_password(true)
        .interact()?;
    Ok(if password.is_empty() {
        None
    } else {
        Some(password)
    })
}

fn prompt_delete_confirmation(ctx: &Context, name: &str) -> Result<String, CorralError> {
    if !ctx.interactive() {
        return Ok(String::new());
    }
    let theme = ColorfulTheme::default();
    let value: String = Input::with_theme(&theme)
        .with_prompt(format!(
            "Type {DELETE_CONFIRMATION} to permanently remove '{name}' and its disks"
        ))
        .allow_empty(true)
        .interact_text()?;
    Ok(value)
}

fn handle_config(ctx: &Context, command: ConfigCommand) -> Result<(), CorralError> {
    match command {
        ConfigCommand::Init => {
            if ctx.config_path.exists() {
                return output(ctx, json!({"path": ctx.config_path, "created": false}));
            }
            write_atomic_text_file(&ctx.config_path, DEFAULT_CONFIG_YAML, None)?;
            output(ctx, json!({"path": ctx.config_path, "created": true}))
        }
        ConfigCommand::Validate => {
            let _cfg = read_config(&ctx.config_path)?;
            output(ctx, json!({"path": ctx.config_path, "valid": true}))
        }
        ConfigCommand::Show => {
            let cfg = load_config(&ctx.config_path)?;
            if ctx.json {
                output(ctx, serde_json::to_value(&cfg)?)
            } else {
                print!("{}", serde_yaml::to_string(&cfg)?);
                Ok(())
            }
        }
    }
}

fn handle_paths(ctx: &Context) -> Result<(), CorralError> {
    let cfg = load_config(&ctx.config_path)?;
    let registry = Registry::new(resolve_state_dir(&cfg));
    output(
        ctx,
        json!({
            "config_path": ctx.config_path,
            "config_exists": ctx.config_path.exists(),
            "state_dir": registry.state_dir(),
            "instances_dir": registry.instances_dir(),
            "image_cache": registry.state_dir().join("images"),
            "tools": resolve_tools(&cfg),
        }),
    )
}

/// Where each configured tool resolves on PATH; `null` when it does not.
fn resolve_tools(cfg: &Config) -> BTreeMap<&'static str, Option<PathBuf>> {
    let seed_builder = match cfg.tools.seed_builder {
        SeedBuilder::CloudLocalds => "cloud-localds",
        SeedBuilder::Genisoimage => "genisoimage",
    };
    [
        ("qemu_system", cfg.tools.qemu_system.as_str()),
        ("qemu_img", cfg.tools.qemu_img.as_str()),
        ("container_engine", cfg.tools.container_engine.as_str()),
        ("seed_builder", seed_builder),
        ("root_wrapper", cfg.tools.root_wrapper.as_str()),
        ("openssl", cfg.tools.openssl.as_str()),
    ]
    .into_iter()
    .map(|(key, program)| (key, which::which(program).ok()))
    .collect()
}

fn handle_profiles(ctx: &Context) -> Result<(), CorralError> {
    let cfg: Config = load_config(&ctx.config_path)?;
    let profiles: Vec<serde_json::Value> = cfg
        .profiles
        .iter()
        .map(|(id, profile)| {
            json!({
                "id": id,
                "name": profile.name,
                "version": profile.version,
                "vm": !profile.image_url.is_empty(),
                "container": !profile.container_image.is_empty(),
                "rootfs": !profile.rootfs_url.is_empty(),
            })
        })
        .collect();
    output(ctx, json!({"profiles": profiles}))
}

fn output(ctx: &Context, payload: serde_json::Value) -> Result<(), CorralError> {
    if ctx.json {
        let wrapper = JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
            error_kind: None,
            error_details: None,
        };
        print_json(&wrapper)?;
    } else {
        println!("{}", payload);
    }
    Ok(())
}

fn print_json<T: Serialize>(payload: &T) -> Result<(), CorralError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_parses_backend_aliases_and_forwards() {
        let cli = Cli::try_parse_from([
            "corral", "create", "web", "--backend", "qemu", "--forward", "8080:80", "--forward",
            "8443:443", "--port", "2222",
        ])
        .unwrap();
        let Commands::Create {
            backend,
            forwards,
            port,
            profile,
            ..
        } = cli.command
        else {
            panic!("expected create");
        };
        assert_eq!(backend, Backend::Vm);
        assert_eq!(port, Some(2222));
        assert_eq!(profile, "ubuntu-jammy");
        assert_eq!(
            forwards,
            vec![
                PortForward { host: 8080, guest: 80 },
                PortForward { host: 8443, guest: 443 },
            ]
        );
    }

    #[test]
    fn malformed_forward_is_rejected_by_the_parser() {
        assert!(Cli::try_parse_from(["corral", "create", "web", "--forward", "8080"]).is_err());
        assert!(Cli::try_parse_from(["corral", "create", "web", "--forward", "0:80"]).is_err());
    }

    #[test]
    fn unknown_backend_is_rejected_by_the_parser() {
        assert!(Cli::try_parse_from(["corral", "create", "web", "--backend", "lxc"]).is_err());
    }

    #[test]
    fn edit_display_flags_conflict() {
        assert!(Cli::try_parse_from(["corral", "edit", "web", "--display", "--headless"]).is_err());
        assert!(
            Cli::try_parse_from(["corral", "edit", "web", "--forward", "1:2", "--clear-forwards"])
                .is_err()
        );
    }

    #[test]
    fn global_flags_work_after_subcommand() {
        let cli = Cli::try_parse_from(["corral", "list", "--json", "--config", "/tmp/c.yaml"]).unwrap();
        assert!(cli.json);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.yaml")));
    }

    #[test]
    fn error_envelope_carries_kind_and_details() {
        let err = CorralError::unsupported("no disk");
        let payload = JsonResult::<serde_json::Value> {
            ok: false,
            result: None,
            error: Some(err.to_string()),
            error_kind: Some(err.kind()),
            error_details: err.details().cloned(),
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["error_kind"], "backend");
        assert_eq!(value["error_details"]["error_code"], "backend_unsupported");
    }
}

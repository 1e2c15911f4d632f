//! jailrun CLI
//!
//! Run scripts locally, inspect the profile catalog and check the host.

use anyhow::Context;
use clap::{Parser, Subcommand};
use jailrun::config::{
    apply_env_overrides, load_config, load_config_from_path, sample_config, validate_config,
};
use jailrun::sandbox::profile::Mechanism;
use jailrun::sandbox::{render_nsjail_config, Sandbox};
use jailrun::{Config, VERSION};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Parser)]
#[command(
    name = "jailrun",
    version = VERSION,
    about = "jailrun - sandboxed execution of untrusted Python",
    long_about = None
)]
struct Cli {
    /// Configuration file (JSON5 or TOML)
    #[arg(long, short, global = true, env = "JAILRUN_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a script and print the outcome as JSON
    Run {
        /// Script file, or `-` for stdin
        script: PathBuf,
    },

    /// Check whether this host can run submissions
    Health,

    /// List the isolation profiles, strongest first
    Profiles {
        /// Also print each profile's nsjail configuration
        #[arg(long)]
        descriptor: bool,
    },

    /// Print a sample configuration file
    InitConfig,
}

fn load(path: Option<&Path>) -> anyhow::Result<Config> {
    let config = match path {
        Some(path) => {
            let mut config = load_config_from_path(path)?;
            apply_env_overrides(&mut config)?;
            config
        }
        None => load_config()?,
    };
    Ok(config)
}

fn read_script(path: &Path) -> anyhow::Result<String> {
    if path == Path::new("-") {
        let mut script = String::new();
        std::io::stdin()
            .read_to_string(&mut script)
            .context("Failed to read script from stdin")?;
        return Ok(script);
    }
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

async fn run(config: Config, script: &Path) -> anyhow::Result<()> {
    let source = read_script(script)?;
    let sandbox = Sandbox::new(config.sandbox);

    match sandbox.execute(&source).await {
        Ok(execution) => {
            println!("{}", serde_json::to_string_pretty(&execution)?);
            if !execution.outcome.is_success() {
                std::process::exit(1);
            }
        }
        Err(e) => {
            let body = serde_json::json!({ "error": e.to_string(), "kind": e.kind() });
            println!("{}", serde_json::to_string_pretty(&body)?);
            std::process::exit(2);
        }
    }
    Ok(())
}

fn health(config: Config) -> anyhow::Result<()> {
    let report = Sandbox::new(config.sandbox).health();
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.available {
        std::process::exit(1);
    }
    Ok(())
}

fn profiles(config: Config, descriptor: bool) -> anyhow::Result<()> {
    let sandbox = Sandbox::new(config.sandbox);
    let workspace = sandbox.config().work_dir.join("jr-<pid>-<uuid>");

    for profile in sandbox.profiles() {
        let ns = &profile.namespaces;
        let enabled: Vec<&str> = [
            ("pid", ns.pid),
            ("mount", ns.mount),
            ("ipc", ns.ipc),
            ("uts", ns.uts),
            ("user", ns.user),
            ("net", ns.net),
        ]
        .iter()
        .filter(|(_, on)| *on)
        .map(|(name, _)| *name)
        .collect();

        println!(
            "{:>2}  {:<12} {:<7} {:<11} {:<7} namespaces: {}",
            profile.rank,
            profile.name,
            format!("{:?}", profile.mechanism).to_lowercase(),
            profile.filesystem.label(),
            format!("{:?}", profile.invocation).to_lowercase(),
            if enabled.is_empty() {
                "none".to_string()
            } else {
                enabled.join(",")
            }
        );

        if descriptor && profile.mechanism == Mechanism::Nsjail {
            for line in render_nsjail_config(profile, &workspace).lines() {
                println!("      {}", line);
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::InitConfig = cli.command {
        println!("{}", sample_config()?);
        return Ok(());
    }

    let config = load(cli.config.as_deref())?;
    config.log.init_tracing();
    for warning in validate_config(&config).into_result()? {
        warn!("Config: {}", warning);
    }

    match cli.command {
        Commands::Run { script } => run(config, &script).await,
        Commands::Health => health(config),
        Commands::Profiles { descriptor } => profiles(config, descriptor),
        Commands::InitConfig => Ok(()),
    }
}

//! fleetgridd: the fleetgrid daemon.
//!
//! Opens the state store and either runs the background driver (running
//! rollouts, action cleanup) or performs a single deployment operation.
//!
//! # Usage
//!
//! ```text
//! fleetgridd run --data-dir /var/lib/fleetgrid --config fleetgrid.toml
//! fleetgridd assign --ds 7 --target dev-01 --target dev-02 --action-type forced
//! fleetgridd cancel --action 42
//! ```

mod commands;
mod daemon;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use fleetgrid_rollout::EngineConfig;
use fleetgrid_state::{ActionType, StateStore};
use tracing::info;

#[derive(Parser)]
#[command(name = "fleetgridd", about = "fleetgrid deployment daemon")]
struct Cli {
    /// Data directory for persistent state.
    #[arg(long, global = true, default_value = "/var/lib/fleetgrid")]
    data_dir: PathBuf,

    /// Engine configuration file (TOML).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Drive running rollouts and action cleanup until interrupted.
    Run,

    /// Assign a distribution set to targets.
    Assign {
        /// Distribution set id.
        #[arg(long)]
        ds: u64,

        /// Controller id of a target; repeat for several targets.
        #[arg(long = "target", required = true)]
        targets: Vec<String>,

        /// Record the set as already installed instead of deploying it.
        #[arg(long)]
        offline: bool,

        #[arg(long, value_enum, default_value = "forced")]
        action_type: ActionTypeArg,

        /// Forced time (epoch millis) for time-forced actions.
        #[arg(long, default_value = "0")]
        forced_time: u64,

        /// Message recorded in the initial action status.
        #[arg(long)]
        message: Option<String>,
    },

    /// Request cancellation of an action.
    Cancel {
        #[arg(long)]
        action: u64,
    },

    /// Force-quit an action that is being canceled.
    ForceQuit {
        #[arg(long)]
        action: u64,
    },

    /// Delete expired terminal actions once.
    Cleanup,
}

#[derive(Clone, Copy, ValueEnum)]
enum ActionTypeArg {
    Soft,
    Forced,
    TimeForced,
    DownloadOnly,
}

impl From<ActionTypeArg> for ActionType {
    fn from(arg: ActionTypeArg) -> Self {
        match arg {
            ActionTypeArg::Soft => ActionType::Soft,
            ActionTypeArg::Forced => ActionType::Forced,
            ActionTypeArg::TimeForced => ActionType::TimeForced,
            ActionTypeArg::DownloadOnly => ActionType::DownloadOnly,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = load_config(cli.config.as_deref())?;
    let store = open_store(&cli.data_dir)?;

    match cli.command {
        Command::Run => daemon::run(store, config).await,
        Command::Assign {
            ds,
            targets,
            offline,
            action_type,
            forced_time,
            message,
        } => {
            let request = commands::AssignRequest {
                distribution_set_id: ds,
                controller_ids: targets,
                offline,
                action_type: action_type.into(),
                forced_time,
                message,
            };
            commands::assign(store, &config, request)
        }
        Command::Cancel { action } => commands::cancel(store, &config, action),
        Command::ForceQuit { action } => commands::force_quit(store, &config, action),
        Command::Cleanup => commands::cleanup(store, &config),
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,fleetgridd=debug,fleetgrid_rollout=debug"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    match path {
        Some(path) => {
            let config = EngineConfig::from_file(path)?;
            info!(path = %path.display(), tenant = %config.tenant.name, "configuration loaded");
            Ok(config)
        }
        None => Ok(EngineConfig::default()),
    }
}

fn open_store(data_dir: &Path) -> anyhow::Result<StateStore> {
    std::fs::create_dir_all(data_dir)?;
    let db_path = data_dir.join("fleetgrid.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assign_arguments_parse() {
        let cli = Cli::try_parse_from([
            "fleetgridd",
            "assign",
            "--ds",
            "7",
            "--target",
            "a",
            "--target",
            "b",
            "--action-type",
            "time-forced",
        ])
        .unwrap();
        match cli.command {
            Command::Assign {
                ds,
                targets,
                offline,
                action_type,
                ..
            } => {
                assert_eq!(ds, 7);
                assert_eq!(targets, vec!["a".to_string(), "b".to_string()]);
                assert!(!offline);
                assert_eq!(ActionType::from(action_type), ActionType::TimeForced);
            }
            _ => panic!("expected assign"),
        }
    }

    #[test]
    fn assign_requires_a_target() {
        assert!(Cli::try_parse_from(["fleetgridd", "assign", "--ds", "7"]).is_err());
    }

    #[test]
    fn store_is_created_in_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("nested");
        open_store(&data_dir).unwrap();
        assert!(data_dir.join("fleetgrid.redb").exists());
    }

    #[test]
    fn missing_config_falls_back_to_defaults() {
        let config = load_config(None).unwrap();
        assert_eq!(config.tenant.name, "default");
    }
}

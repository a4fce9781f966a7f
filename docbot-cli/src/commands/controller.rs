//! `docbot controller` — supervisor lifecycle over the control socket.

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use colored::Colorize;
use serde_json::Value;

use docbot_daemon::paths::socket_path;
use docbot_daemon::{
    read_pid, request_refresh, request_status, request_stop, start_blocking, ControllerConfig,
    DaemonError,
};

use super::home_dir;

#[derive(Subcommand, Debug)]
pub enum ControllerCommand {
    /// Run the controller in the foreground.
    Start(StartArgs),
    /// Request graceful shutdown over the control socket.
    Stop,
    /// Query runtime status over the control socket.
    Status,
    /// Run a batch commit refresh now and print its summary.
    Refresh,
}

#[derive(Args, Debug)]
pub struct StartArgs {
    /// Periodically refresh head commits of all tracked pull requests.
    #[arg(long)]
    pub enable_pr_sync: bool,

    /// Seconds between batch refreshes.
    #[arg(long, value_name = "SECS")]
    pub sync_interval: Option<u64>,

    /// Workers per controller.
    #[arg(long)]
    pub workers: Option<usize>,
}

impl StartArgs {
    fn apply(self, mut config: ControllerConfig) -> ControllerConfig {
        if self.enable_pr_sync {
            config.enable_pr_sync = true;
        }
        if let Some(secs) = self.sync_interval {
            config.sync_interval_secs = secs;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        config
    }
}

pub fn run(command: ControllerCommand) -> Result<()> {
    let home = home_dir()?;

    match command {
        ControllerCommand::Start(args) => {
            let config = ControllerConfig::load_at(&home)
                .context("failed to load controller config")?
                .with_env();
            let config = args.apply(config);
            start_blocking(&home, config).context("controller exited with error")?;
        }
        ControllerCommand::Stop => match request_stop(&home) {
            Ok(()) => println!("controller stop requested"),
            Err(DaemonError::DaemonNotRunning { .. }) => println!("controller is not running"),
            Err(err) => return Err(err).context("failed to stop controller"),
        },
        ControllerCommand::Status => match request_status(&home) {
            Ok(status) => print_json(&status)?,
            Err(DaemonError::DaemonNotRunning { .. }) => {
                let payload = serde_json::json!({
                    "running": false,
                    "stale_pid": read_pid(&home),
                    "socket": socket_path(&home).display().to_string(),
                });
                print_json(&payload)?;
            }
            Err(err) => return Err(err).context("failed to query controller status"),
        },
        ControllerCommand::Refresh => {
            let record = request_refresh(&home).context("refresh failed")?;
            let summary = &record["summary"];
            println!(
                "{} {} repositories, {} updated, {} orphaned, {} failures",
                "refresh:".bold(),
                summary["groups"],
                summary["updated"].to_string().green(),
                summary["orphaned"].to_string().yellow(),
                summary["failures"].to_string().red(),
            );
            print_json(&record)?;
        }
    }

    Ok(())
}

fn print_json(value: &Value) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed to render controller JSON")?
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config() {
        let args = StartArgs {
            enable_pr_sync: true,
            sync_interval: Some(5),
            workers: None,
        };
        let config = args.apply(ControllerConfig {
            workers: 7,
            ..ControllerConfig::default()
        });
        assert!(config.enable_pr_sync);
        assert_eq!(config.sync_interval_secs, 5);
        assert_eq!(config.workers, 7);
    }

    #[test]
    fn absent_flag_keeps_file_setting() {
        let args = StartArgs {
            enable_pr_sync: false,
            sync_interval: None,
            workers: None,
        };
        let config = args.apply(ControllerConfig {
            enable_pr_sync: true,
            ..ControllerConfig::default()
        });
        assert!(config.enable_pr_sync);
    }
}

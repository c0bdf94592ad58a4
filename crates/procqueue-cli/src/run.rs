//! Builds a process queue from command-line arguments and runs it.

use crate::{LaunchArgs, RunArgs};
use anyhow::{Context, Result};
use procqueue_core::{
    parse_queue_json, CommandSpec, Launcher, LauncherPath, ProcessQueue, RunSummary,
    SchedulerConfig, Settings,
};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

fn load_settings(args: &LaunchArgs) -> Result<Option<Settings>> {
    args.config
        .as_ref()
        .map(|path| Settings::load(path).with_context(|| format!("loading {}", path.display())))
        .transpose()
}

fn build_launcher(args: &LaunchArgs, settings: Option<&Settings>) -> Launcher {
    let resolved = LauncherPath::resolve(args.launcher.as_deref(), settings);
    let entry_point = args
        .entry_point
        .clone()
        .or_else(|| settings.and_then(|s| s.entry_point.clone()));

    info!(
        "Launcher {} ({:?}), entry point {}",
        resolved.path.display(),
        resolved.source,
        entry_point.as_deref().unwrap_or("<none>")
    );
    Launcher::new(resolved.path, entry_point)
}

/// Scheduler config: defaults, then the settings file, then flags.
fn build_config(args: &RunArgs, settings: Option<&Settings>) -> SchedulerConfig {
    let mut config = SchedulerConfig::default();
    if let Some(settings) = settings {
        settings.apply_to(&mut config);
    }
    if let Some(limit) = args.limit {
        config.processes_limit = limit;
    }
    if let Some(delay) = args.delay {
        config.delay = Duration::from_secs(delay);
    }
    if let Some(timeout) = args.timeout {
        config = config.with_process_timeout(Duration::from_secs(timeout));
    }
    config
}

fn collect_commands(args: &LaunchArgs, queue_file: Option<&Path>) -> Result<Vec<CommandSpec>> {
    let mut commands = Vec::new();

    if let Some(path) = queue_file {
        let content =
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        commands.extend(
            parse_queue_json(&content).with_context(|| format!("parsing {}", path.display()))?,
        );
    }
    for line in &args.commands {
        commands.push(CommandSpec::parse_line(line)?);
    }

    Ok(commands)
}

/// Run every queued command to completion. Ctrl-C kills the pool.
pub fn run_queue(args: &RunArgs) -> Result<RunSummary> {
    let settings = load_settings(&args.launch)?;
    let config = build_config(args, settings.as_ref());
    let launcher = build_launcher(&args.launch, settings.as_ref());
    let commands = collect_commands(&args.launch, args.queue_file.as_deref())?;

    if commands.is_empty() {
        warn!("Nothing to run: no commands given");
        return Ok(RunSummary::default());
    }

    let queue = Arc::new(ProcessQueue::new(config, launcher));
    queue.enqueue_all(commands);

    let handle = queue.clone();
    ctrlc::set_handler(move || {
        warn!("Interrupted, stopping all processes");
        handle.stop(true);
    })
    .context("installing Ctrl-C handler")?;

    Ok(queue.start()?)
}

/// Launch each command detached and return their PIDs.
pub fn launch_background(args: &LaunchArgs) -> Result<Vec<u32>> {
    let settings = load_settings(args)?;
    let launcher = build_launcher(args, settings.as_ref());

    collect_commands(args, None)?
        .iter()
        .map(|spec| launcher.call_in_background(spec).map_err(anyhow::Error::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[test]
    fn test_flags_override_settings() {
        let settings = Settings {
            processes_limit: Some(3),
            delay_secs: Some(5),
            process_timeout_secs: Some(60),
            ..Settings::default()
        };
        let args = RunArgs {
            limit: Some(7),
            timeout: Some(0),
            ..RunArgs::default()
        };

        let config = build_config(&args, Some(&settings));
        assert_eq!(config.processes_limit, 7);
        assert_eq!(config.delay, Duration::from_secs(5));
        assert_eq!(config.process_timeout, None);
    }

    #[test]
    fn test_defaults_without_settings() {
        let config = build_config(&RunArgs::default(), None);
        assert_eq!(config, SchedulerConfig::default());
    }

    #[test]
    fn test_entry_point_falls_back_to_settings() {
        let settings = Settings {
            launcher_path: Some(PathBuf::from("/usr/bin/php")),
            entry_point: Some("artisan".to_string()),
            ..Settings::default()
        };
        let launcher = build_launcher(&LaunchArgs::default(), Some(&settings));

        assert_eq!(launcher.executable(), PathBuf::from("/usr/bin/php"));
        assert_eq!(launcher.entry_point(), Some("artisan"));
    }

    #[test]
    fn test_collect_commands_file_then_positional() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("queue.json");
        fs::write(&path, r#"["generate-invoices", ["generate-user-invoice", [150]]]"#).unwrap();

        let args = LaunchArgs {
            commands: vec!["cleanup --force".to_string()],
            ..LaunchArgs::default()
        };
        let commands = collect_commands(&args, Some(&path)).unwrap();

        assert_eq!(
            commands,
            vec![
                CommandSpec::simple("generate-invoices"),
                CommandSpec::with_args("generate-user-invoice", [150]),
                CommandSpec::with_args("cleanup", ["--force"]),
            ]
        );
    }

    #[test]
    fn test_collect_commands_bad_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("queue.json");
        fs::write(&path, r#"{"not": "a list"}"#).unwrap();

        assert!(collect_commands(&LaunchArgs::default(), Some(&path)).is_err());
    }

    #[test]
    fn test_run_without_commands_is_noop() {
        let summary = run_queue(&RunArgs::default()).unwrap();
        assert_eq!(summary, RunSummary::default());
    }
}

use anyhow::{bail, Result};
use std::fs;
use std::path::Path;

/// Maps a debug flag to the log targets it raises to `Debug`.
fn debug_targets(flag: &str) -> Result<&'static [&'static str]> {
    let targets: &'static [&'static str] = match flag {
        "WEB" => &["lib_vent::fanout", "server_ventilation::ventilation_logic::downstream"],
        "VENT" => &["lib_vent::core::arbiter"],
        "SERIAL" => &["lib_vent::actuator"],
        "MQTT" => &["lib_vent::bridge"],
        "BUS" => &["lib_vent::core::bus"],
        "ALL" => &["lib_vent", "server_ventilation"],
        other => bail!("unknown debug flag '{}'", other),
    };
    Ok(targets)
}

/// Parses the comma separated `--debug` list.
pub fn parse_debug_flags(flags: &str) -> Result<Vec<&'static str>> {
    let mut targets = Vec::new();
    for flag in flags.split(',').map(str::trim).filter(|f| !f.is_empty()) {
        targets.extend_from_slice(debug_targets(&flag.to_uppercase())?);
    }
    Ok(targets)
}

pub fn setup_logging(log_dir: &Path, log_level: &str, debug_flags: Option<&str>) -> Result<()> {
    if !log_dir.exists() {
        fs::create_dir_all(log_dir)?;
    }

    // Clean up old log files, keeping only the most recent one
    cleanup_old_logs(log_dir)?;

    let log_file_name = format!("server_ventilation_{}.log", chrono::Local::now().format("%Y-%m-%d_%H-%M-%S"));
    let log_path = log_dir.join(log_file_name);

    let level = match log_level.to_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        _ => log::LevelFilter::Info,
    };

    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d %H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(level);

    if let Some(flags) = debug_flags {
        for target in parse_debug_flags(flags)? {
            dispatch = dispatch.level_for(target, log::LevelFilter::Debug.max(level));
        }
    }

    dispatch
        .chain(std::io::stdout())
        .chain(fern::log_file(log_path)?)
        .apply()?;

    Ok(())
}

fn cleanup_old_logs(log_dir: &Path) -> Result<()> {
    let mut entries: Vec<_> = fs::read_dir(log_dir)?
        .filter_map(|res| res.ok())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "log"))
        .filter_map(|e| e.metadata().and_then(|m| m.modified()).ok().map(|t| (t, e)))
        .collect();

    // Sort by modification time, newest first
    entries.sort_by_key(|(modified, _)| std::cmp::Reverse(*modified));

    // Keep the most recent one (index 0), delete the rest
    for (_, entry) in entries.iter().skip(1) {
        if let Err(e) = fs::remove_file(entry.path()) {
            eprintln!("Failed to delete old log file {:?}: {}", entry.path(), e);
        }
    }

    Ok(())
}

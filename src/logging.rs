//! Logging setup (§10.1): `fern` dispatch with a `chrono` timestamp,
//! configured from `[brim] log_name`/`log_level`/`log_facility`.

use crate::error::LoggingError;
use crate::plan::LogConfig;
use std::path::Path;

/// Builds the global logger. In the foreground (`no-daemon`/`-o`) this
/// writes to stderr; once daemonized, `daemonize()` has already
/// redirected stdio to `/dev/null`, so the sink is a log file instead,
/// named after `pid_file`'s directory and `log_name` (§6 has no
/// dedicated `log_file` option, so the pidfile's directory is the only
/// writable, already-resolved location known at this point).
pub fn init(config: &LogConfig, foreground: bool, pid_file: &Path) -> Result<(), LoggingError> {
    let level = parse_level(&config.level);
    let name = config.name.clone();
    let dispatch = fern::Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "{} [{}] {}: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                name,
                message
            ))
        })
        .level(level);

    let dispatch = if foreground {
        dispatch.chain(std::io::stderr())
    } else {
        let path = log_file_path(config, pid_file);
        let file = fern::log_file(&path).map_err(|e| LoggingError {
            message: format!("{}: {e}", path.display()),
        })?;
        dispatch.chain(file)
    };

    dispatch.apply().map_err(|e| LoggingError {
        message: e.to_string(),
    })
}

fn log_file_path(config: &LogConfig, pid_file: &Path) -> std::path::PathBuf {
    pid_file.with_file_name(format!("{}.log", config.name))
}

fn parse_level(raw: &str) -> log::LevelFilter {
    match raw.to_ascii_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "warn" | "warning" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        "off" | "none" => log::LevelFilter::Off,
        _ => log::LevelFilter::Info,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_level_falls_back_to_info() {
        assert_eq!(parse_level("bogus"), log::LevelFilter::Info);
    }

    #[test]
    fn recognizes_standard_levels() {
        assert_eq!(parse_level("DEBUG"), log::LevelFilter::Debug);
        assert_eq!(parse_level("warning"), log::LevelFilter::Warn);
    }

    #[test]
    fn log_file_path_sits_beside_the_pidfile() {
        let config = LogConfig {
            name: "brimd".into(),
            level: "info".into(),
            facility: "daemon".into(),
        };
        let path = log_file_path(&config, Path::new("/var/run/brimd.pid"));
        assert_eq!(path, Path::new("/var/run/brimd.log"));
    }
}

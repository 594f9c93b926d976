//! Command-line surface (§10.4): the verbs a deployment's `brimd`-based
//! binary exposes around one `LaunchPlan`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "brimd", about = "Process-supervising launcher")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path to the INI-style config file (`-c`).
    #[arg(short = 'c', long = "config", global = true, default_value = "/etc/brimd.conf")]
    pub config: PathBuf,

    /// Override the pidfile path from `[brim] pid_file` (`-p`).
    #[arg(short = 'p', long = "pidfile", global = true)]
    pub pidfile: Option<PathBuf>,

    /// Run in the foreground instead of daemonizing (`-o`); equivalent
    /// to the `no-daemon` verb (§6: "`-o` = no-daemon/foreground").
    #[arg(short = 'o', long = "foreground", global = true)]
    pub foreground: bool,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Daemonize and start the supervised worker pool.
    Start,
    /// Signal a running instance (named by its pidfile) to shut down.
    Stop,
    /// Equivalent to `stop` followed by `start`.
    Restart,
    /// Signal a running instance to restart its workers under the same
    /// frozen plan (Open Question (i): no config re-read).
    Reload,
    /// Alias of `stop`, kept for operational muscle memory.
    Shutdown,
    /// Report whether the pidfile names a live process.
    Status,
    /// Run in the foreground without daemonizing; useful under a
    /// process supervisor of its own, or for local development.
    NoDaemon,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_no_daemon_verb() {
        let cli = Cli::parse_from(["brimd", "-c", "/tmp/brimd.conf", "no-daemon"]);
        assert_eq!(cli.command, Command::NoDaemon);
        assert_eq!(cli.config, PathBuf::from("/tmp/brimd.conf"));
        assert!(!cli.foreground);
    }

    #[test]
    fn dash_o_is_equivalent_to_no_daemon() {
        let cli = Cli::parse_from(["brimd", "-o", "start"]);
        assert_eq!(cli.command, Command::Start);
        assert!(cli.foreground);
    }
}

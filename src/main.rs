use brimd::cli::{Cli, Command};
use brimd::config::ConfigProvider;
use brimd::dispatch::registry::FactoryRegistry;
use brimd::plan::LaunchPlan;
use brimd::{daemonize, demos, pidfile, supervisor};
use clap::Parser;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::time::{Duration, Instant};

fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(&cli) {
        eprintln!("{e}");
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<(), String> {
    match cli.command {
        Command::Start => start(cli, !cli.foreground),
        Command::NoDaemon => start(cli, false),
        Command::Stop | Command::Shutdown => signal_running(cli, Signal::SIGTERM).map(|_| ()),
        Command::Reload => signal_running(cli, Signal::SIGHUP).map(|_| ()),
        Command::Restart => {
            // §8: `restart` must behave like `stop` then `start` to an
            // outside observer, so wait for the old process to actually
            // exit before forking a new one instead of racing it.
            let grace = resolved_shutdown_grace(cli)?;
            if let Some(pid) = signal_running(cli, Signal::SIGTERM)? {
                wait_for_exit(pid, grace + Duration::from_secs(5));
            }
            start(cli, !cli.foreground)
        }
        Command::Status => status(cli),
    }
}

fn registry() -> FactoryRegistry {
    let mut registry = FactoryRegistry::new();
    demos::register_all(&mut registry);
    registry
}

fn load_conf(cli: &Cli) -> Result<ConfigProvider, String> {
    ConfigProvider::from_path(&cli.config).map_err(|e| e.to_string())
}

fn resolved_pid_file(cli: &Cli) -> Result<std::path::PathBuf, String> {
    if let Some(p) = &cli.pidfile {
        return Ok(p.clone());
    }
    let conf = load_conf(cli)?;
    Ok(std::path::PathBuf::from(
        conf.get_string("brim", "pid_file", "/var/run/brimd.pid"),
    ))
}

fn resolved_shutdown_grace(cli: &Cli) -> Result<Duration, String> {
    let conf = load_conf(cli)?;
    let secs = conf
        .get_u32("brim", "shutdown_grace_sec", 60)
        .map_err(|e| e.to_string())?;
    Ok(Duration::from_secs(u64::from(secs)))
}

/// Builds the `LaunchPlan` exactly once (§3: frozen at startup) and
/// hands it to the parent controller. `daemonize_process` runs before
/// the plan is built so config errors during a backgrounded `start`
/// are still reported on the original terminal before it detaches.
fn start(cli: &Cli, daemonize_process: bool) -> Result<(), String> {
    let conf = load_conf(cli)?;
    let mut plan = LaunchPlan::build(&conf, &registry()).map_err(|e| e.to_string())?;
    if let Some(path) = &cli.pidfile {
        plan.pid_file = path.clone();
    }

    if daemonize_process {
        daemonize::daemonize().map_err(|e| format!("failed to daemonize: {e}"))?;
    }

    supervisor::parent::run(plan, registry(), !daemonize_process).map_err(|e| e.to_string())
}

/// Signals a running instance and returns the pid it signaled, so
/// `restart` can wait for that exact process to exit.
fn signal_running(cli: &Cli, signal: Signal) -> Result<Option<i32>, String> {
    let path = resolved_pid_file(cli)?;
    let pid = pidfile::read(&path)
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("no pidfile at {}", path.display()))?;
    kill(Pid::from_raw(pid), signal).map_err(|e| format!("could not signal pid {pid}: {e}"))?;
    Ok(Some(pid))
}

/// Polls the pidfile-named process's liveness until it dies or
/// `timeout` elapses.
fn wait_for_exit(pid: i32, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while pidfile::process_alive(pid) && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(100));
    }
}

fn status(cli: &Cli) -> Result<(), String> {
    let path = resolved_pid_file(cli)?;
    match pidfile::read(&path).map_err(|e| e.to_string())? {
        None => {
            println!("not running (no pidfile at {})", path.display());
            Ok(())
        }
        Some(pid) if pidfile::process_alive(pid) => {
            println!("running (pid {pid})");
            Ok(())
        }
        Some(pid) => {
            println!("not running (stale pidfile names pid {pid})");
            Ok(())
        }
    }
}

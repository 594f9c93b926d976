//! C2: Parent Controller — binds listeners, drops privilege, forks the
//! worker pool, and supervises it for the life of the process (§4.1,
//! §4.2).

use super::{worker, ChildTermination, RestartBackoff, WorkerRole};
use crate::dispatch::registry::FactoryRegistry;
use crate::error::LauncherError;
use crate::plan::{LaunchPlan, SubInstance};
use crate::signal_handler::{self, SignalState};
use crate::stats::StatsRegion;
use crate::{listener, logging, pidfile, privilege};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use std::collections::HashMap;
use std::net::{TcpListener, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};

enum BoundListener {
    Tcp(TcpListener),
    Udp(UdpSocket),
}

struct ChildSlot {
    role: WorkerRole,
    started_at: Instant,
    backoff: RestartBackoff,
    expected_exit: bool,
}

/// Runs the whole launcher lifecycle against an already-built, frozen
/// `plan` (the caller is responsible for reading the config file and
/// applying any `-p` pidfile override before calling this): write the
/// pidfile, bind listeners, open the log sink, drop privilege, allocate
/// the stats region, install signal handlers, fork, supervise, shut
/// down. Blocks until a graceful shutdown completes. Follows the §4.1
/// startup order exactly; once the pidfile has been written, any
/// failure on the steps that follow removes it again before returning.
///
/// `foreground` selects the log sink (stderr vs. a file beside the
/// pidfile) and is `true` for `no-daemon`/`-o`, `false` for `start`.
pub fn run(plan: LaunchPlan, registry: FactoryRegistry, foreground: bool) -> Result<(), LauncherError> {
    let registry = Arc::new(registry);

    pidfile::check_not_running(&plan.pid_file)?;
    pidfile::write(&plan.pid_file, std::process::id() as i32)?;

    let result = run_after_pidfile_write(plan.clone(), &registry, foreground);
    if result.is_err() {
        pidfile::remove(&plan.pid_file);
    }
    result
}

fn run_after_pidfile_write(
    plan: LaunchPlan,
    registry: &Arc<FactoryRegistry>,
    foreground: bool,
) -> Result<(), LauncherError> {
    let mut listeners: HashMap<String, BoundListener> = HashMap::new();
    for sub in &plan.sub_instances {
        let bound = match sub {
            SubInstance::Wsgi(w) => BoundListener::Tcp(listener::bind_tcp(&w.common)?),
            SubInstance::Tcp(t) => BoundListener::Tcp(listener::bind_tcp(&t.common)?),
            SubInstance::Udp(u) => BoundListener::Udp(listener::bind_udp(&u.common)?),
        };
        listeners.insert(sub.common().name.clone(), bound);
    }

    logging::init(&plan.log, foreground, &plan.pid_file)?;

    privilege::apply(
        plan.identity.user.as_deref(),
        plan.identity.group.as_deref(),
        plan.identity.umask,
    )?;

    let region = Arc::new(allocate_stats_region(&plan)?);

    let signal_state = SignalState::new();
    let _signal_guard = signal_handler::install(signal_state.clone()).ok();

    let plan = Arc::new(plan);
    let mut children: HashMap<Pid, ChildSlot> = HashMap::new();
    fork_all(&plan, registry, &region, &listeners, &mut children)?;

    supervise(&plan, registry, &region, &listeners, &mut children, &signal_state);

    pidfile::remove(&plan.pid_file);
    Ok(())
}

fn allocate_stats_region(plan: &LaunchPlan) -> Result<StatsRegion, LauncherError> {
    let mut keys = Vec::new();
    for sub in &plan.sub_instances {
        let decls = sub.declared_stats();
        for scope in sub.worker_scopes() {
            for decl in &decls {
                keys.push((scope.clone(), decl.name.clone()));
            }
        }
    }
    for daemon in &plan.daemons {
        let scope = daemon.scope();
        for decl in daemon.declared_stats() {
            keys.push((scope.clone(), decl.name));
        }
    }
    StatsRegion::allocate(&keys).map_err(|e| {
        LauncherError::Bind(crate::error::BindError {
            address: "stats-region".into(),
            port: 0,
            attempts: 1,
            os_error: e.to_string(),
        })
    })
}

fn fork_all(
    plan: &Arc<LaunchPlan>,
    registry: &Arc<FactoryRegistry>,
    region: &Arc<StatsRegion>,
    listeners: &HashMap<String, BoundListener>,
    children: &mut HashMap<Pid, ChildSlot>,
) -> Result<(), LauncherError> {
    for sub in &plan.sub_instances {
        for idx in 0..sub.common().worker_count.max(1) {
            let role = match sub {
                SubInstance::Wsgi(_) => WorkerRole::Wsgi {
                    sub_instance: sub.common().name.clone(),
                    worker_index: idx,
                },
                SubInstance::Tcp(_) => WorkerRole::Tcp {
                    sub_instance: sub.common().name.clone(),
                    worker_index: idx,
                },
                SubInstance::Udp(_) => WorkerRole::Udp {
                    sub_instance: sub.common().name.clone(),
                    worker_index: idx,
                },
            };
            spawn_one(
                plan,
                registry,
                region,
                listeners,
                children,
                sub,
                idx,
                role,
                RestartBackoff::new(),
            )?;
        }
    }
    for daemon in &plan.daemons {
        spawn_daemon(plan, registry, region, children, daemon, RestartBackoff::new())?;
    }
    Ok(())
}

fn spawn_one(
    plan: &Arc<LaunchPlan>,
    registry: &Arc<FactoryRegistry>,
    region: &Arc<StatsRegion>,
    listeners: &HashMap<String, BoundListener>,
    children: &mut HashMap<Pid, ChildSlot>,
    sub: &SubInstance,
    idx: usize,
    role: WorkerRole,
    backoff: RestartBackoff,
) -> Result<Pid, LauncherError> {
    // SAFETY: single-threaded fork point — no other thread holds a lock
    // that could deadlock in the child (the signal-handling thread is
    // spawned only after this function returns, via `install_worker` in
    // the child itself).
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => {
            children.insert(
                child,
                ChildSlot {
                    role,
                    started_at: Instant::now(),
                    backoff,
                    expected_exit: false,
                },
            );
            Ok(child)
        }
        Ok(ForkResult::Child) => {
            let code = run_child_body(plan, registry, region, listeners, sub, idx);
            std::process::exit(code);
        }
        Err(e) => Err(LauncherError::Bind(crate::error::BindError {
            address: sub.common().name.clone(),
            port: sub.common().bind_port,
            attempts: 1,
            os_error: e.to_string(),
        })),
    }
}

fn run_child_body(
    plan: &Arc<LaunchPlan>,
    registry: &Arc<FactoryRegistry>,
    region: &Arc<StatsRegion>,
    listeners: &HashMap<String, BoundListener>,
    sub: &SubInstance,
    idx: usize,
) -> i32 {
    let _ = plan;
    match (sub, listeners.get(&sub.common().name)) {
        (SubInstance::Wsgi(w), Some(BoundListener::Tcp(l))) => {
            worker::run_wsgi(w, l, region, registry, idx)
        }
        (SubInstance::Tcp(t), Some(BoundListener::Tcp(l))) => {
            worker::run_tcp(t, l, region, registry, idx)
        }
        (SubInstance::Udp(u), Some(BoundListener::Udp(s))) => {
            worker::run_udp(u, s, region, registry, idx)
        }
        _ => {
            log::error!("sub-instance '{}' has no matching bound listener", sub.common().name);
            1
        }
    }
}

fn spawn_daemon(
    plan: &Arc<LaunchPlan>,
    registry: &Arc<FactoryRegistry>,
    region: &Arc<StatsRegion>,
    children: &mut HashMap<Pid, ChildSlot>,
    daemon: &crate::plan::DaemonSpec,
    backoff: RestartBackoff,
) -> Result<Pid, LauncherError> {
    let _ = plan;
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => {
            children.insert(
                child,
                ChildSlot {
                    role: WorkerRole::Daemon {
                        name: daemon.handler.name.clone(),
                    },
                    started_at: Instant::now(),
                    backoff,
                    expected_exit: false,
                },
            );
            Ok(child)
        }
        Ok(ForkResult::Child) => {
            let code = worker::run_daemon(daemon, region, registry);
            std::process::exit(code);
        }
        Err(e) => Err(LauncherError::Bind(crate::error::BindError {
            address: daemon.handler.name.clone(),
            port: 0,
            attempts: 1,
            os_error: e.to_string(),
        })),
    }
}

fn supervise(
    plan: &Arc<LaunchPlan>,
    registry: &Arc<FactoryRegistry>,
    region: &Arc<StatsRegion>,
    listeners: &HashMap<String, BoundListener>,
    children: &mut HashMap<Pid, ChildSlot>,
    signal_state: &SignalState,
) {
    loop {
        if signal_state.shutdown.is_set() {
            shut_down(children, plan.shutdown_grace);
            return;
        }
        if signal_state.reload_requested() {
            log::info!("reloading: restarting every worker under the same plan");
            shut_down(children, plan.shutdown_grace);
            if fork_all(plan, registry, region, listeners, children).is_err() {
                log::error!("reload failed to refork workers; shutting down");
                return;
            }
            continue;
        }

        match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {
                std::thread::sleep(Duration::from_millis(200));
            }
            Ok(WaitStatus::Exited(pid, code)) => {
                reap(plan, registry, region, listeners, children, pid, ChildTermination::Exit(code));
            }
            Ok(WaitStatus::Signaled(pid, sig, _)) => {
                reap(
                    plan,
                    registry,
                    region,
                    listeners,
                    children,
                    pid,
                    ChildTermination::Signal(sig as i32),
                );
            }
            Ok(_) => {}
            Err(nix::errno::Errno::ECHILD) => {
                std::thread::sleep(Duration::from_millis(200));
            }
            Err(e) => {
                log::warn!("waitpid failed: {e}");
                std::thread::sleep(Duration::from_millis(200));
            }
        }
    }
}

fn reap(
    plan: &Arc<LaunchPlan>,
    registry: &Arc<FactoryRegistry>,
    region: &Arc<StatsRegion>,
    listeners: &HashMap<String, BoundListener>,
    children: &mut HashMap<Pid, ChildSlot>,
    pid: Pid,
    termination: ChildTermination,
) {
    let Some(mut slot) = children.remove(&pid) else {
        return;
    };
    if slot.expected_exit {
        log::info!("{:?} exited cooperatively ({:?})", slot.role, termination);
        return;
    }

    log::warn!("{:?} exited unexpectedly ({:?}); restarting", slot.role, termination);
    let scope = slot.role.scope();
    let restarts = region.raw_get(&scope, "subprocess_restart_count") + 1;
    region.reset_scope(&scope);
    region.handle_for_scope(scope).set("subprocess_restart_count", restarts as i64);

    let uptime = slot.started_at.elapsed();
    let delay = slot.backoff.next_delay(uptime);
    std::thread::sleep(delay);

    let role = slot.role.clone();
    let backoff = slot.backoff;
    let result = match &role {
        WorkerRole::Wsgi { sub_instance, worker_index }
        | WorkerRole::Tcp { sub_instance, worker_index }
        | WorkerRole::Udp { sub_instance, worker_index } => {
            find_sub(plan, sub_instance).and_then(|sub| {
                spawn_one(
                    plan,
                    registry,
                    region,
                    listeners,
                    children,
                    sub,
                    *worker_index,
                    role.clone(),
                    backoff,
                )
                .ok()
            })
        }
        WorkerRole::Daemon { name } => plan
            .daemons
            .iter()
            .find(|d| &d.handler.name == name)
            .and_then(|d| spawn_daemon(plan, registry, region, children, d, backoff).ok()),
    };
    if result.is_none() {
        log::error!("could not refork {role:?} after restart backoff");
    }
}

fn find_sub<'a>(plan: &'a LaunchPlan, name: &str) -> Option<&'a SubInstance> {
    plan.sub_instances.iter().find(|s| s.common().name == name)
}

fn shut_down(children: &mut HashMap<Pid, ChildSlot>, grace: Duration) {
    for (pid, slot) in children.iter_mut() {
        slot.expected_exit = true;
        let _ = kill(*pid, Signal::SIGTERM);
    }
    let deadline = Instant::now() + grace;
    while !children.is_empty() && Instant::now() < deadline {
        match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(pid, _)) | Ok(WaitStatus::Signaled(pid, _, _)) => {
                children.remove(&pid);
            }
            _ => std::thread::sleep(Duration::from_millis(100)),
        }
    }
    for pid in children.keys() {
        let _ = kill(*pid, Signal::SIGKILL);
    }
    children.clear();
}

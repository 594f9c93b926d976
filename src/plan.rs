//! L4: Sub-instance Model + the `LaunchPlan` entity (§3).
//!
//! `LaunchPlan` is built once from a `ConfigProvider` and a
//! `FactoryRegistry`, then frozen — every `parse_conf`/`stats_conf` hook
//! runs here, before any fork, so that a factory failure aborts startup
//! cleanly per §4.1 step 1.

use crate::config::ConfigProvider;
use crate::dispatch::registry::FactoryRegistry;
use crate::error::LauncherError;
use crate::stats::{AggregationKind, StatDeclaration};
use std::collections::HashSet;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct HandlerSpec {
    pub name: String,
    pub factory_path: String,
    pub parsed_conf: serde_json::Value,
    pub declared_stats: Vec<StatDeclaration>,
}

#[derive(Debug, Clone)]
pub struct ListenerCommon {
    pub name: String,
    pub bind_address: String,
    pub bind_port: u16,
    pub worker_count: usize,
    pub backlog: i32,
    pub accept_timeout: Option<Duration>,
    pub listen_retry: u32,
    pub thread_pool_size: usize,
}

#[derive(Debug, Clone)]
pub struct WsgiListener {
    pub common: ListenerCommon,
    pub handlers: Vec<HandlerSpec>,
    pub client_timeout: Option<Duration>,
    pub log_headers: bool,
    pub tracked_status_codes: HashSet<u16>,
    pub wsgi_input_iter_chunk_size: usize,
}

#[derive(Debug, Clone)]
pub struct TcpListener {
    pub common: ListenerCommon,
    pub handler: HandlerSpec,
}

#[derive(Debug, Clone)]
pub struct UdpListener {
    pub common: ListenerCommon,
    pub handler: HandlerSpec,
}

#[derive(Debug, Clone)]
pub enum SubInstance {
    Wsgi(WsgiListener),
    Tcp(TcpListener),
    Udp(UdpListener),
}

impl SubInstance {
    #[must_use]
    pub fn common(&self) -> &ListenerCommon {
        match self {
            Self::Wsgi(w) => &w.common,
            Self::Tcp(t) => &t.common,
            Self::Udp(u) => &u.common,
        }
    }

    #[must_use]
    pub fn kind_tag(&self) -> &'static str {
        match self {
            Self::Wsgi(_) => "wsgi",
            Self::Tcp(_) => "tcp",
            Self::Udp(_) => "udp",
        }
    }

    /// All stats declared for this sub-instance: the two universal
    /// defaults, plus WSGI's extra status-class reservations, plus every
    /// handler's own declared stats (§3 invariants).
    #[must_use]
    pub fn declared_stats(&self) -> Vec<StatDeclaration> {
        let mut decls = vec![
            StatDeclaration::new("request_count", AggregationKind::Sum),
            StatDeclaration::timestamp("start_time", AggregationKind::Min),
        ];
        match self {
            Self::Wsgi(w) => {
                decls.push(StatDeclaration::new(
                    "status_2xx_count",
                    AggregationKind::Sum,
                ));
                decls.push(StatDeclaration::new(
                    "status_3xx_count",
                    AggregationKind::Sum,
                ));
                decls.push(StatDeclaration::new(
                    "status_4xx_count",
                    AggregationKind::Sum,
                ));
                decls.push(StatDeclaration::new(
                    "status_5xx_count",
                    AggregationKind::Sum,
                ));
                for code in &w.tracked_status_codes {
                    decls.push(StatDeclaration::new(
                        format!("status_{code}_count"),
                        AggregationKind::Sum,
                    ));
                }
                for handler in &w.handlers {
                    decls.extend(handler.declared_stats.clone());
                }
            }
            Self::Tcp(t) => decls.extend(t.handler.declared_stats.clone()),
            Self::Udp(u) => decls.extend(u.handler.declared_stats.clone()),
        }
        decls.push(StatDeclaration::new(
            "subprocess_restart_count",
            AggregationKind::Sum,
        ));
        decls
    }

    /// Per-worker scope string for worker `idx` (§3 entity StatBucket).
    #[must_use]
    pub fn scope(&self, idx: usize) -> String {
        format!("{}:{}:{}", self.kind_tag(), self.common().name, idx)
    }

    #[must_use]
    pub fn worker_scopes(&self) -> Vec<String> {
        (0..self.common().worker_count.max(1))
            .map(|i| self.scope(i))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct DaemonSpec {
    pub handler: HandlerSpec,
}

impl DaemonSpec {
    #[must_use]
    pub fn scope(&self) -> String {
        format!("daemon:{}", self.handler.name)
    }

    #[must_use]
    pub fn declared_stats(&self) -> Vec<StatDeclaration> {
        let mut decls = vec![
            StatDeclaration::new("request_count", AggregationKind::Sum),
            StatDeclaration::timestamp("start_time", AggregationKind::Min),
            StatDeclaration::new("subprocess_restart_count", AggregationKind::Sum),
        ];
        decls.extend(self.handler.declared_stats.clone());
        decls
    }
}

#[derive(Debug, Clone)]
pub struct ProcessIdentity {
    pub user: Option<String>,
    pub group: Option<String>,
    pub umask: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub name: String,
    pub level: String,
    pub facility: String,
}

/// Immutable, frozen-after-parse launch configuration (§3 entity
/// LaunchPlan).
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub identity: ProcessIdentity,
    pub pid_file: std::path::PathBuf,
    pub log: LogConfig,
    pub sub_instances: Vec<SubInstance>,
    pub daemons: Vec<DaemonSpec>,
    pub tracked_status_codes: HashSet<u16>,
    pub shutdown_grace: Duration,
}

impl LaunchPlan {
    pub fn build(
        conf: &ConfigProvider,
        registry: &FactoryRegistry,
    ) -> Result<Self, LauncherError> {
        let identity = ProcessIdentity {
            user: conf.get("brim", "user").map(str::to_string),
            group: conf.get("brim", "group").map(str::to_string),
            umask: conf
                .get("brim", "umask")
                .map(|v| u32::from_str_radix(v, 8))
                .transpose()
                .map_err(|_| crate::error::ConfigError::BadValue {
                    section: "brim".into(),
                    key: "umask".into(),
                    value: conf.get("brim", "umask").unwrap_or_default().to_string(),
                })?,
        };

        let pid_file = std::path::PathBuf::from(
            conf.get_string("brim", "pid_file", "/var/run/brimd.pid"),
        );

        let log = LogConfig {
            name: conf.get_string("brim", "log_name", "brimd"),
            level: conf.get_string("brim", "log_level", "info"),
            facility: conf.get_string("brim", "log_facility", "daemon"),
        };

        let tracked_status_codes = parse_tracked_codes(
            &conf.get_list("brim", "count_status_codes"),
        );

        let mut sub_instances = Vec::new();
        for name in conf.sections_in_family("wsgi") {
            sub_instances.push(SubInstance::Wsgi(build_wsgi(
                name,
                conf,
                registry,
                &tracked_status_codes,
            )?));
        }
        for name in conf.sections_in_family("tcp") {
            sub_instances.push(SubInstance::Tcp(build_tcp(name, conf, registry)?));
        }
        for name in conf.sections_in_family("udp") {
            sub_instances.push(SubInstance::Udp(build_udp(name, conf, registry)?));
        }

        let daemons = build_daemons(conf, registry)?;

        Ok(Self {
            identity,
            pid_file,
            log,
            sub_instances,
            daemons,
            tracked_status_codes,
            shutdown_grace: Duration::from_secs(
                u64::from(conf.get_u32("brim", "shutdown_grace_sec", 60)?),
            ),
        })
    }
}

fn parse_tracked_codes(raw: &[String]) -> HashSet<u16> {
    if raw.is_empty() {
        return crate::dispatch::chain::default_tracked_status_codes();
    }
    raw.iter().filter_map(|s| s.parse().ok()).collect()
}

fn listener_common(
    name: &str,
    conf: &ConfigProvider,
    default_workers: usize,
) -> Result<ListenerCommon, LauncherError> {
    let bind_address = conf.get_string(name, "ip", "0.0.0.0");
    let bind_port = conf.get_u16(name, "port", 0)?;
    let worker_count = conf.get_u32(name, "workers", default_workers as u32)? as usize;
    let backlog = conf.get_u32(name, "backlog", 128)? as i32;
    let listen_retry = conf.get_u32(name, "listen_retry", 30)?;
    let accept_timeout = conf
        .get(name, "client_timeout")
        .and_then(|v| v.parse::<f64>().ok())
        .map(Duration::from_secs_f64);
    let thread_pool_size = conf.get_u32(name, "threads", 4)? as usize;
    Ok(ListenerCommon {
        name: name.to_string(),
        bind_address,
        bind_port,
        worker_count,
        backlog,
        accept_timeout,
        listen_retry,
        thread_pool_size,
    })
}

fn build_handler_spec(
    app_name: &str,
    conf: &ConfigProvider,
    parse: impl FnOnce(&str, &ConfigProvider) -> Result<(serde_json::Value, Vec<StatDeclaration>), LauncherError>,
) -> Result<HandlerSpec, LauncherError> {
    let factory_path = conf.get_required(app_name, "call")?.to_string();
    let (parsed_conf, declared_stats) = parse(app_name, conf)?;
    Ok(HandlerSpec {
        name: app_name.to_string(),
        factory_path,
        parsed_conf,
        declared_stats,
    })
}

fn build_wsgi(
    name: &str,
    conf: &ConfigProvider,
    registry: &FactoryRegistry,
    default_tracked: &HashSet<u16>,
) -> Result<WsgiListener, LauncherError> {
    let common = listener_common(name, conf, 1)?;
    let app_names = conf.get_list(name, "apps");
    let mut handlers = Vec::with_capacity(app_names.len());
    for app_name in &app_names {
        let factory_path = conf.get_required(app_name, "call")?.to_string();
        let factory = registry.wsgi(&factory_path)?;
        handlers.push(build_handler_spec(app_name, conf, |n, c| {
            let parsed = factory.parse_conf(n, c).map_err(LauncherError::FactoryInit)?;
            Ok((parsed, factory.stats_conf(n, c)))
        })?);
    }

    let tracked = {
        let raw = conf.get_list(name, "count_status_codes");
        if raw.is_empty() {
            default_tracked.clone()
        } else {
            parse_tracked_codes(&raw)
        }
    };

    Ok(WsgiListener {
        common,
        handlers,
        client_timeout: conf
            .get(name, "client_timeout")
            .and_then(|v| v.parse::<f64>().ok())
            .map(Duration::from_secs_f64),
        log_headers: conf.get_bool(name, "log_headers", false),
        tracked_status_codes: tracked,
        wsgi_input_iter_chunk_size: conf.get_u32(name, "wsgi_input_iter_chunk_size", 4096)? as usize,
    })
}

fn build_tcp(
    name: &str,
    conf: &ConfigProvider,
    registry: &FactoryRegistry,
) -> Result<TcpListener, LauncherError> {
    let common = listener_common(name, conf, 1)?;
    let factory_path = conf.get_required(name, "call")?.to_string();
    let factory = registry.tcp(&factory_path)?;
    let handler = build_handler_spec(name, conf, |n, c| {
        let parsed = factory.parse_conf(n, c).map_err(LauncherError::FactoryInit)?;
        Ok((parsed, factory.stats_conf(n, c)))
    })?;
    Ok(TcpListener { common, handler })
}

fn build_udp(
    name: &str,
    conf: &ConfigProvider,
    registry: &FactoryRegistry,
) -> Result<UdpListener, LauncherError> {
    let mut common = listener_common(name, conf, 1)?;
    // Open Question (ii): UDP worker fan-out is platform-dependent;
    // brimd fixes N=1 unless SO_REUSEPORT-style sharing is explicitly
    // supported, which it currently is not.
    if common.worker_count > 1 {
        log::warn!(
            "udp sub-instance '{name}' requested {} workers; clamping to 1 (no port-sharing support)",
            common.worker_count
        );
        common.worker_count = 1;
    }
    let factory_path = conf.get_required(name, "call")?.to_string();
    let factory = registry.udp(&factory_path)?;
    let handler = build_handler_spec(name, conf, |n, c| {
        let parsed = factory.parse_conf(n, c).map_err(LauncherError::FactoryInit)?;
        Ok((parsed, factory.stats_conf(n, c)))
    })?;
    Ok(UdpListener { common, handler })
}

fn build_daemons(
    conf: &ConfigProvider,
    registry: &FactoryRegistry,
) -> Result<Vec<DaemonSpec>, LauncherError> {
    let names = conf.get_list("daemons", "daemons");
    let mut daemons = Vec::with_capacity(names.len());
    for name in &names {
        let factory_path = conf.get_required(name, "call")?.to_string();
        let factory = registry.daemon(&factory_path)?;
        let handler = build_handler_spec(name, conf, |n, c| {
            let parsed = factory.parse_conf(n, c).map_err(LauncherError::FactoryInit)?;
            Ok((parsed, factory.stats_conf(n, c)))
        })?;
        daemons.push(DaemonSpec { handler });
    }
    Ok(daemons)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_file;
    use crate::dispatch::registry::{DaemonFactory, PreParseHooks, TcpFactory, UdpFactory, WsgiFactory};
    use crate::dispatch::{Daemon, ShutdownFlag, SubInstanceHandle, TcpHandler, UdpHandler, WsgiContext, WsgiHandler, WsgiResponse};
    use std::sync::Arc;

    struct NoopWsgi;
    impl PreParseHooks for NoopWsgi {}
    impl WsgiFactory for NoopWsgi {
        fn build(
            &self,
            _name: &str,
            _parsed_conf: &serde_json::Value,
            next: Arc<dyn WsgiHandler>,
        ) -> Arc<dyn WsgiHandler> {
            next
        }
    }

    struct NoopTcp;
    impl PreParseHooks for NoopTcp {}
    impl TcpFactory for NoopTcp {
        fn build(&self, _name: &str, _c: &serde_json::Value) -> Arc<dyn TcpHandler> {
            struct H;
            impl TcpHandler for H {
                fn handle(
                    &self,
                    _s: &SubInstanceHandle,
                    _st: &crate::stats::StatsHandle,
                    _stream: std::net::TcpStream,
                    _peer: std::net::SocketAddr,
                ) {
                }
            }
            Arc::new(H)
        }
    }

    struct NoopUdp;
    impl PreParseHooks for NoopUdp {}
    impl UdpFactory for NoopUdp {
        fn build(&self, _name: &str, _c: &serde_json::Value) -> Arc<dyn UdpHandler> {
            struct H;
            impl UdpHandler for H {
                fn handle(
                    &self,
                    _s: &SubInstanceHandle,
                    _st: &crate::stats::StatsHandle,
                    _sock: &std::net::UdpSocket,
                    _data: &[u8],
                    _peer: std::net::SocketAddr,
                ) {
                }
            }
            Arc::new(H)
        }
    }

    struct NoopDaemon;
    impl PreParseHooks for NoopDaemon {}
    impl DaemonFactory for NoopDaemon {
        fn build(&self, _name: &str, _c: &serde_json::Value) -> Arc<dyn Daemon> {
            struct D;
            impl Daemon for D {
                fn run(
                    &self,
                    _s: &SubInstanceHandle,
                    _st: &crate::stats::StatsHandle,
                    _shutdown: &ShutdownFlag,
                ) {
                }
            }
            Arc::new(D)
        }
    }

    fn registry() -> FactoryRegistry {
        let mut r = FactoryRegistry::new();
        r.register_wsgi("demos.echo", Arc::new(NoopWsgi));
        r.register_tcp("demos.tcp_echo", Arc::new(NoopTcp));
        r.register_udp("demos.udp_echo", Arc::new(NoopUdp));
        r.register_daemon("demos.heartbeat", Arc::new(NoopDaemon));
        r
    }

    #[test]
    fn builds_plan_with_multiple_listeners() {
        let content = "\
[brim]
pid_file = /tmp/brimd.pid

[wsgi]
port = 8901
apps = echo

[echo]
call = demos.echo

[wsgi#alt]
port = 8902
apps = echo

[tcp]
port = 9001
call = demos.tcp_echo

[udp]
port = 9002
workers = 4
call = demos.udp_echo

[daemons]
daemons = beat

[beat]
call = demos.heartbeat
";
        let cfg = ConfigProvider::new(parse_file(content).unwrap());
        let plan = LaunchPlan::build(&cfg, &registry()).unwrap();
        assert_eq!(plan.sub_instances.len(), 4);
        assert_eq!(plan.daemons.len(), 1);

        let udp = plan
            .sub_instances
            .iter()
            .find(|s| s.kind_tag() == "udp")
            .unwrap();
        // Open Question (ii): UDP is clamped to 1 worker.
        assert_eq!(udp.common().worker_count, 1);
    }

    #[test]
    fn unresolvable_factory_is_fatal_before_any_fork() {
        let content = "\
[wsgi]
port = 8901
apps = echo

[echo]
call = does.not.exist
";
        let cfg = ConfigProvider::new(parse_file(content).unwrap());
        let err = LaunchPlan::build(&cfg, &registry()).unwrap_err();
        assert!(matches!(err, LauncherError::FactoryInit(_)));
    }

    #[test]
    fn declared_stats_include_defaults_and_status_classes() {
        let content = "\
[wsgi]
port = 8901
apps = echo

[echo]
call = demos.echo
";
        let cfg = ConfigProvider::new(parse_file(content).unwrap());
        let plan = LaunchPlan::build(&cfg, &registry()).unwrap();
        let names: Vec<String> = plan.sub_instances[0]
            .declared_stats()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert!(names.contains(&"request_count".to_string()));
        assert!(names.contains(&"start_time".to_string()));
        assert!(names.contains(&"status_404_count".to_string()));
    }
}

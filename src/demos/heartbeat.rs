//! `demos.heartbeat`: a daemon that bumps a counter on an interval until
//! told to shut down. Stands in for background work like cache warmers
//! or queue drainers (§4.5 "Daemon").

use crate::config::ConfigProvider;
use crate::dispatch::registry::{DaemonFactory, PreParseHooks};
use crate::dispatch::{Daemon, ShutdownFlag, SubInstanceHandle};
use crate::stats::{AggregationKind, StatDeclaration, StatsHandle};
use std::sync::Arc;
use std::time::Duration;

pub struct HeartbeatFactory;

impl PreParseHooks for HeartbeatFactory {
    fn stats_conf(&self, _name: &str, _conf: &ConfigProvider) -> Vec<StatDeclaration> {
        vec![StatDeclaration::new("beats", AggregationKind::Sum)]
    }
}

impl DaemonFactory for HeartbeatFactory {
    fn build(&self, _name: &str, parsed_conf: &serde_json::Value) -> Arc<dyn Daemon> {
        let interval_ms = parsed_conf
            .get("interval_ms")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(1000);
        Arc::new(HeartbeatDaemon { interval_ms })
    }
}

struct HeartbeatDaemon {
    interval_ms: u64,
}

impl Daemon for HeartbeatDaemon {
    fn run(&self, _sub_instance: &SubInstanceHandle, stats: &StatsHandle, shutdown: &ShutdownFlag) {
        while !shutdown.is_set() {
            stats.incr("beats");
            std::thread::sleep(Duration::from_millis(self.interval_ms));
        }
    }
}

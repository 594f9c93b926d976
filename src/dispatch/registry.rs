//! Factory registry: dotted-path string -> factory value (§9 "Class-method
//! pre-parse hooks" redesign note). Resolution of the dotted path to a
//! concrete factory is itself the injected resolver the spec treats as
//! an external collaborator (§4.5); `FactoryRegistry` is the in-process
//! registration point a deployment populates before calling
//! `LaunchPlan::build`.

use super::{Daemon, TcpHandler, UdpHandler, WsgiHandler};
use crate::config::ConfigProvider;
use crate::error::FactoryInitError;
use crate::stats::StatDeclaration;
use std::collections::HashMap;
use std::sync::Arc;

/// Optional pre-parse hooks every factory variant may implement
/// (§4.5). Both default to no-ops, matching "Optional `parse_conf`/
/// `stats_conf` become optional interface methods with default no-ops"
/// (§9).
pub trait PreParseHooks {
    /// Run in the parent before any fork. An error aborts startup with
    /// the message surfaced unchanged (§4.1 step 1, §7).
    fn parse_conf(
        &self,
        _name: &str,
        _conf: &ConfigProvider,
    ) -> Result<serde_json::Value, FactoryInitError> {
        Ok(serde_json::Value::Null)
    }

    /// Run in the parent; results are fixed into the `LaunchPlan` before
    /// any fork (§3 invariants).
    fn stats_conf(&self, _name: &str, _conf: &ConfigProvider) -> Vec<StatDeclaration> {
        Vec::new()
    }
}

/// Factory for one WSGI chain link. `build` is called per worker with
/// the already-parsed config and the next link in the chain.
pub trait WsgiFactory: PreParseHooks + Send + Sync {
    fn build(
        &self,
        name: &str,
        parsed_conf: &serde_json::Value,
        next_in_chain: Arc<dyn WsgiHandler>,
    ) -> Arc<dyn WsgiHandler>;
}

pub trait TcpFactory: PreParseHooks + Send + Sync {
    fn build(&self, name: &str, parsed_conf: &serde_json::Value) -> Arc<dyn TcpHandler>;
}

pub trait UdpFactory: PreParseHooks + Send + Sync {
    fn build(&self, name: &str, parsed_conf: &serde_json::Value) -> Arc<dyn UdpHandler>;
}

pub trait DaemonFactory: PreParseHooks + Send + Sync {
    fn build(&self, name: &str, parsed_conf: &serde_json::Value) -> Arc<dyn Daemon>;
}

/// Registry mapping a dotted factory path (e.g. `demos.echo_app`) to a
/// concrete factory. Populated once at process startup, before
/// `LaunchPlan::build` runs.
#[derive(Default, Clone)]
pub struct FactoryRegistry {
    wsgi: HashMap<String, Arc<dyn WsgiFactory>>,
    tcp: HashMap<String, Arc<dyn TcpFactory>>,
    udp: HashMap<String, Arc<dyn UdpFactory>>,
    daemon: HashMap<String, Arc<dyn DaemonFactory>>,
}

impl FactoryRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_wsgi(&mut self, path: impl Into<String>, factory: Arc<dyn WsgiFactory>) {
        self.wsgi.insert(path.into(), factory);
    }
    pub fn register_tcp(&mut self, path: impl Into<String>, factory: Arc<dyn TcpFactory>) {
        self.tcp.insert(path.into(), factory);
    }
    pub fn register_udp(&mut self, path: impl Into<String>, factory: Arc<dyn UdpFactory>) {
        self.udp.insert(path.into(), factory);
    }
    pub fn register_daemon(&mut self, path: impl Into<String>, factory: Arc<dyn DaemonFactory>) {
        self.daemon.insert(path.into(), factory);
    }

    pub fn wsgi(&self, path: &str) -> Result<Arc<dyn WsgiFactory>, FactoryInitError> {
        self.wsgi
            .get(path)
            .cloned()
            .ok_or_else(|| unresolved(path))
    }
    pub fn tcp(&self, path: &str) -> Result<Arc<dyn TcpFactory>, FactoryInitError> {
        self.tcp.get(path).cloned().ok_or_else(|| unresolved(path))
    }
    pub fn udp(&self, path: &str) -> Result<Arc<dyn UdpFactory>, FactoryInitError> {
        self.udp.get(path).cloned().ok_or_else(|| unresolved(path))
    }
    pub fn daemon(&self, path: &str) -> Result<Arc<dyn DaemonFactory>, FactoryInitError> {
        self.daemon
            .get(path)
            .cloned()
            .ok_or_else(|| unresolved(path))
    }
}

fn unresolved(path: &str) -> FactoryInitError {
    FactoryInitError {
        factory: path.to_string(),
        message: format!("could not resolve factory '{path}'"),
    }
}

//! `demos.tcp_echo`: reads one chunk per connection and writes it back.

use crate::dispatch::registry::{PreParseHooks, TcpFactory};
use crate::dispatch::{SubInstanceHandle, TcpHandler};
use crate::stats::{AggregationKind, StatDeclaration, StatsHandle};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;

pub struct TcpEchoFactory;
impl PreParseHooks for TcpEchoFactory {
    fn stats_conf(&self, _name: &str, _conf: &crate::config::ConfigProvider) -> Vec<StatDeclaration> {
        vec![StatDeclaration::new("bytes_echoed", AggregationKind::Sum)]
    }
}
impl TcpFactory for TcpEchoFactory {
    fn build(&self, _name: &str, _parsed_conf: &serde_json::Value) -> Arc<dyn TcpHandler> {
        Arc::new(TcpEchoHandler)
    }
}

struct TcpEchoHandler;

impl TcpHandler for TcpEchoHandler {
    fn handle(
        &self,
        _sub_instance: &SubInstanceHandle,
        stats: &StatsHandle,
        mut stream: TcpStream,
        _peer: SocketAddr,
    ) {
        let mut buf = [0u8; 4096];
        if let Ok(n) = stream.read(&mut buf) {
            if n > 0 {
                let _ = stream.write_all(&buf[..n]);
                stats.set("bytes_echoed", stats.get("bytes_echoed") as i64 + n as i64);
            }
        }
    }
}

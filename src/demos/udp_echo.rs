//! `demos.udp_echo`: answers each datagram with the same bytes.

use crate::dispatch::registry::{PreParseHooks, UdpFactory};
use crate::dispatch::{SubInstanceHandle, UdpHandler};
use crate::stats::StatsHandle;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;

pub struct UdpEchoFactory;
impl PreParseHooks for UdpEchoFactory {}
impl UdpFactory for UdpEchoFactory {
    fn build(&self, _name: &str, _parsed_conf: &serde_json::Value) -> Arc<dyn UdpHandler> {
        Arc::new(UdpEchoHandler)
    }
}

struct UdpEchoHandler;

impl UdpHandler for UdpEchoHandler {
    fn handle(
        &self,
        _sub_instance: &SubInstanceHandle,
        _stats: &StatsHandle,
        socket: &UdpSocket,
        datagram: &[u8],
        peer: SocketAddr,
    ) {
        let _ = socket.send_to(datagram, peer);
    }
}

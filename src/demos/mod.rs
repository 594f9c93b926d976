//! Sample handlers used by the `brimd` binary's default registry and by
//! the boundary-scenario tests (§8). These are external collaborators
//! from the launcher's point of view — ordinary `WsgiFactory`/
//! `TcpFactory`/`UdpFactory`/`DaemonFactory` implementations a real
//! deployment would instead supply from its own crate.

pub mod echo;
pub mod heartbeat;
pub mod tcp_echo;
pub mod udp_echo;

use crate::dispatch::registry::FactoryRegistry;
use std::sync::Arc;

/// Registers every demo handler under a `demos.*` dotted path.
pub fn register_all(registry: &mut FactoryRegistry) {
    registry.register_wsgi("demos.echo", Arc::new(echo::EchoFactory));
    registry.register_tcp("demos.tcp_echo", Arc::new(tcp_echo::TcpEchoFactory));
    registry.register_udp("demos.udp_echo", Arc::new(udp_echo::UdpEchoFactory));
    registry.register_daemon("demos.heartbeat", Arc::new(heartbeat::HeartbeatFactory));
}

//! C3: Request/Task Dispatch Contracts (§4.5).
//!
//! The original system's duck-typed handler/daemon objects become four
//! explicit capability traits here, per the redesign in §9: `WsgiHandler`,
//! `TcpHandler`, `UdpHandler`, and `Daemon`. The per-request global
//! environment becomes an explicit context value (`WsgiContext`) that
//! handlers read and mutate fields on, instead of a shared mutable dict.

pub mod chain;
pub mod registry;

use crate::stats::StatsHandle;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A 128-bit random request id, rendered as hex (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestId(pub u128);

impl RequestId {
    #[must_use]
    pub fn generate() -> Self {
        // Two u64 reads from the OS RNG via getrandom-less libc fallback
        // would be heavier than needed here; brimd draws from /dev/urandom
        // once per request through libc's arc4random-style call.
        let mut bytes = [0u8; 16];
        unsafe {
            libc::getrandom(bytes.as_mut_ptr().cast(), bytes.len(), 0);
        }
        Self(u128::from_ne_bytes(bytes))
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Handle to the sub-instance a handler is running under — name and
/// worker index, mostly useful for log lines and diagnostics.
#[derive(Debug, Clone)]
pub struct SubInstanceHandle {
    pub sub_instance_name: String,
    pub worker_index: usize,
}

/// A minimal WSGI-shaped request environment. Real deployments would
/// flesh out headers/query-string/etc.; this is the surface §4.5
/// actually specifies plus what the built-in status-accounting link
/// needs.
#[derive(Debug, Clone)]
pub struct WsgiRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub peer: SocketAddr,
}

#[derive(Debug, Clone)]
pub struct WsgiResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl WsgiResponse {
    #[must_use]
    pub fn not_found() -> Self {
        Self {
            status: 404,
            headers: vec![("content-length".into(), "0".into())],
            body: Vec::new(),
        }
    }

    #[must_use]
    pub fn internal_error() -> Self {
        Self {
            status: 500,
            headers: vec![("content-length".into(), "0".into())],
            body: Vec::new(),
        }
    }
}

/// Per-request context injected alongside the request environment
/// (§4.5): start timestamp, logger, request id, extra log tokens, the
/// stats write handle, and JSON encode/decode callables.
pub struct WsgiContext {
    pub sub_instance: SubInstanceHandle,
    pub request: WsgiRequest,
    pub start: std::time::Instant,
    pub request_id: RequestId,
    pub extra_log_tokens: Vec<String>,
    pub stats: StatsHandle,
    pub json_codec: Arc<dyn JsonCodec>,
}

impl WsgiContext {
    pub fn log_token(&mut self, token: impl Into<String>) {
        self.extra_log_tokens.push(token.into());
    }
}

/// Injected pair of encode/decode functions (§1: "JSON codec selection
/// treated as an injected pair of encode/decode functions"). The default
/// implementation below just forwards to `serde_json`.
pub trait JsonCodec: Send + Sync {
    fn dumps(&self, value: &serde_json::Value) -> String;
    fn loads(&self, text: &str) -> Result<serde_json::Value, String>;
}

pub struct SerdeJsonCodec;

impl JsonCodec for SerdeJsonCodec {
    fn dumps(&self, value: &serde_json::Value) -> String {
        value.to_string()
    }
    fn loads(&self, text: &str) -> Result<serde_json::Value, String> {
        serde_json::from_str(text).map_err(|e| e.to_string())
    }
}

/// One link in the WSGI handler chain (§4.5 "WSGI handler").
///
/// The first link whose path matches handles the request; otherwise it
/// forwards to `next`. The built-in final link (`chain::NotFoundLink`)
/// always matches and returns 404.
pub trait WsgiHandler: Send + Sync {
    fn name(&self) -> &str;
    fn handle(&self, ctx: &mut WsgiContext) -> WsgiResponse;
}

/// Constructed with `(name, parsed_conf)`; invoked per accepted
/// connection (§4.5 "TCP handler"). Owns the connection's lifecycle.
pub trait TcpHandler: Send + Sync {
    fn handle(
        &self,
        sub_instance: &SubInstanceHandle,
        stats: &StatsHandle,
        stream: std::net::TcpStream,
        peer: SocketAddr,
    );
}

/// Constructed with `(name, parsed_conf)`; invoked per datagram (§4.5
/// "UDP handler"). Must not close the shared socket.
pub trait UdpHandler: Send + Sync {
    fn handle(
        &self,
        sub_instance: &SubInstanceHandle,
        stats: &StatsHandle,
        socket: &std::net::UdpSocket,
        datagram: &[u8],
        peer: SocketAddr,
    );
}

/// Cooperative shutdown flag passed to a running daemon body; the
/// daemon should observe it and return promptly (§4.5 "Daemon").
#[derive(Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Constructed with `(name, parsed_conf)`; invoked once per process and
/// expected to run indefinitely until `shutdown` is set (§4.5 "Daemon").
pub trait Daemon: Send + Sync {
    fn run(&self, sub_instance: &SubInstanceHandle, stats: &StatsHandle, shutdown: &ShutdownFlag);
}

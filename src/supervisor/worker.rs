//! Worker child bodies: what a forked process actually runs (§4.1 step
//! 6, §4.5).

use super::now_unix;
use crate::dispatch::chain::{sub_instance_handle, StatusAccountingChain};
use crate::dispatch::registry::FactoryRegistry;
use crate::dispatch::{RequestId, SerdeJsonCodec, ShutdownFlag, WsgiContext, WsgiHandler, WsgiRequest};
use crate::plan::{DaemonSpec, TcpListener as TcpSpec, UdpListener as UdpSpec, WsgiListener};
use crate::stats::StatsRegion;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::io::Read;
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::os::fd::AsFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn build_wsgi_chain(
    sub: &WsgiListener,
    registry: &FactoryRegistry,
) -> Result<StatusAccountingChain, crate::error::FactoryInitError> {
    let mut next: Arc<dyn WsgiHandler> = Arc::new(crate::dispatch::chain::NotFoundLink);
    for handler in sub.handlers.iter().rev() {
        let factory = registry.wsgi(&handler.factory_path)?;
        next = factory.build(&handler.name, &handler.parsed_conf, next);
    }
    Ok(StatusAccountingChain::new(
        next,
        sub.tracked_status_codes.clone(),
    ))
}

/// Polls a batch of non-blocking stream fds for readability, returning
/// which indices (into `streams`, in order) are ready. Shared by
/// `run_wsgi` and `run_tcp` so both cooperate on one thread per worker
/// instead of either spawning OS threads or blocking on one connection
/// at a time (§5 Concurrency/Parallelism Model).
fn poll_readable<'a>(streams: impl Iterator<Item = &'a TcpStream>, timeout_ms: u8) -> Vec<bool> {
    let mut pollfds: Vec<PollFd> = streams
        .map(|s| PollFd::new(s.as_fd(), PollFlags::POLLIN))
        .collect();
    if pollfds.is_empty() {
        return Vec::new();
    }
    let _ = poll(&mut pollfds, PollTimeout::from(timeout_ms));
    pollfds
        .iter()
        .map(|pfd| {
            pfd.revents()
                .map(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR))
                .unwrap_or(false)
        })
        .collect()
}

enum ReadStep {
    NeedMore,
    ClientClosed,
    Complete(WsgiRequest),
}

/// One in-progress WSGI request, parsed incrementally across however
/// many non-blocking reads it takes — the state a cooperative scheduler
/// needs to suspend on I/O and resume a different connection instead of
/// blocking the whole worker on a slow client (§5, fixing the prior
/// fully-serial accept loop).
struct InFlight {
    stream: TcpStream,
    peer: SocketAddr,
    buf: Vec<u8>,
    header_end: Option<usize>,
    content_length: usize,
    start: Instant,
    request_id: RequestId,
    last_activity: Instant,
}

impl InFlight {
    fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        let now = Instant::now();
        Self {
            stream,
            peer,
            buf: Vec::new(),
            header_end: None,
            content_length: 0,
            start: now,
            request_id: RequestId::generate(),
            last_activity: now,
        }
    }

    fn pump(&mut self, chunk_size: usize) -> ReadStep {
        let mut chunk = vec![0u8; chunk_size.max(1)];
        match self.stream.read(&mut chunk) {
            Ok(0) => return ReadStep::ClientClosed,
            Ok(n) => {
                self.buf.extend_from_slice(&chunk[..n]);
                self.last_activity = Instant::now();
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return ReadStep::NeedMore,
            Err(_) => return ReadStep::ClientClosed,
        }

        if self.header_end.is_none() {
            match find_header_terminator(&self.buf) {
                Some(pos) => {
                    self.content_length = parse_content_length(&self.buf[..pos]);
                    self.header_end = Some(pos);
                }
                None => return ReadStep::NeedMore,
            }
        }
        let header_end = self.header_end.expect("set above");
        if self.buf.len() < header_end + 4 + self.content_length {
            return ReadStep::NeedMore;
        }

        let head = String::from_utf8_lossy(&self.buf[..header_end]).into_owned();
        let mut lines = head.split("\r\n");
        let Some(request_line) = lines.next() else {
            return ReadStep::ClientClosed;
        };
        let mut parts = request_line.split_whitespace();
        let method = parts.next().unwrap_or("GET").to_string();
        let path = parts.next().unwrap_or("/").to_string();

        let mut headers = Vec::new();
        for line in lines {
            if let Some((k, v)) = line.split_once(':') {
                headers.push((k.trim().to_lowercase(), v.trim().to_string()));
            }
        }

        let mut body = self.buf[header_end + 4..].to_vec();
        body.truncate(self.content_length);

        ReadStep::Complete(WsgiRequest {
            method,
            path,
            headers,
            body,
            peer: self.peer,
        })
    }
}

fn parse_content_length(head: &[u8]) -> usize {
    String::from_utf8_lossy(head)
        .split("\r\n")
        .find_map(|line| {
            let (k, v) = line.split_once(':')?;
            k.trim().eq_ignore_ascii_case("content-length").then(|| v.trim().to_string())
        })
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

fn find_header_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Runs a WSGI worker: a single-threaded cooperative multiplexer over
/// up to `thread_pool_size` in-flight connections (renamed in spirit,
/// not in config key, to "max concurrent connections" now that there is
/// no OS thread pool). Each connection is driven forward a
/// non-blocking read at a time by `InFlight::pump`; once a request is
/// fully buffered, the worker dispatches and writes the response
/// synchronously before returning to the poll loop — the handler chain
/// itself still runs to completion in one go, as a cooperative runtime
/// expects its handlers not to monopolize the CPU rather than
/// preempting them (§5). Returns the exit code the child process should
/// use.
pub fn run_wsgi(
    sub: &WsgiListener,
    listener: &TcpListener,
    region: &Arc<StatsRegion>,
    registry: &FactoryRegistry,
    worker_index: usize,
) -> i32 {
    let shutdown = ShutdownFlag::new();
    let _signals = crate::signal_handler::install_worker(shutdown.clone()).ok();

    let scope = super::WorkerRole::Wsgi {
        sub_instance: sub.common.name.clone(),
        worker_index,
    }
    .scope();
    let stats = region.handle_for_scope(scope);
    stats.set("start_time", now_unix());

    let chain = match build_wsgi_chain(sub, registry) {
        Ok(c) => c,
        Err(e) => {
            log::error!("wsgi worker '{}' could not build its handler chain: {e}", sub.common.name);
            return 1;
        }
    };
    let json_codec = Arc::new(SerdeJsonCodec);
    let handle = sub_instance_handle(&sub.common.name, worker_index);
    let max_inflight = sub.common.thread_pool_size.max(1);

    let mut inflight: Vec<InFlight> = Vec::new();
    while !shutdown.is_set() {
        while inflight.len() < max_inflight {
            match listener.accept() {
                Ok((stream, peer)) => {
                    if stream.set_nonblocking(true).is_err() {
                        continue;
                    }
                    inflight.push(InFlight::new(stream, peer));
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::warn!("wsgi worker '{}' accept failed: {e}", sub.common.name);
                    break;
                }
            }
        }

        if inflight.is_empty() {
            std::thread::sleep(Duration::from_millis(20));
            continue;
        }

        let ready = poll_readable(inflight.iter().map(|c| &c.stream), 20);
        let mut next_round = Vec::with_capacity(inflight.len());
        for (is_ready, mut conn) in ready.into_iter().zip(inflight.into_iter()) {
            if !is_ready {
                if let Some(timeout) = sub.client_timeout {
                    if conn.last_activity.elapsed() > timeout {
                        stats.incr("request_count");
                        stats.incr("status_4xx_count");
                        stats.incr("status_408_count");
                        log::warn!(
                            "request {} on {} from {}: timed out waiting for the client",
                            conn.request_id,
                            sub.common.name,
                            conn.peer
                        );
                        continue;
                    }
                }
                next_round.push(conn);
                continue;
            }

            match conn.pump(sub.wsgi_input_iter_chunk_size) {
                ReadStep::NeedMore => next_round.push(conn),
                ReadStep::ClientClosed => {}
                ReadStep::Complete(request) => {
                    dispatch_one(
                        sub,
                        &chain,
                        &handle,
                        &stats,
                        &json_codec,
                        conn.stream,
                        request,
                        conn.start,
                        conn.request_id,
                    );
                }
            }
        }
        inflight = next_round;
    }
    0
}

#[allow(clippy::too_many_arguments)]
fn dispatch_one(
    sub: &WsgiListener,
    chain: &StatusAccountingChain,
    handle: &crate::dispatch::SubInstanceHandle,
    stats: &crate::stats::StatsHandle,
    json_codec: &Arc<SerdeJsonCodec>,
    mut stream: TcpStream,
    request: WsgiRequest,
    start: Instant,
    request_id: RequestId,
) {
    let method = request.method.clone();
    let path = request.path.clone();
    let body_len = request.body.len();
    let mut ctx = WsgiContext {
        sub_instance: handle.clone(),
        request,
        start,
        request_id,
        extra_log_tokens: Vec::new(),
        stats: stats.clone(),
        json_codec: json_codec.clone(),
    };
    let response = chain.dispatch(&mut ctx);
    let response_len = response.body.len();
    if sub.log_headers {
        for (k, v) in &ctx.request.headers {
            ctx.log_token(format!("{k}={v}"));
        }
    }
    let wrote = write_wsgi_response(&mut stream, &response);
    if !wrote {
        // Client went away mid-response: the status line was already
        // accounted by `chain.dispatch` above, so this does not
        // re-account 499 over it (§10.7 resolution (iii)); it only
        // notes the disconnect in the access log.
        log::warn!(
            "request {request_id} on {}: client disconnected before the response was fully written",
            ctx.sub_instance.sub_instance_name
        );
    }
    log_request(
        &ctx,
        &method,
        &path,
        response.status,
        body_len,
        response_len,
        start.elapsed(),
    );
}

/// NOTICE-level access-log line (§4.5 "Request log line"): request id,
/// client, method, path, status, byte lengths, duration in ms, and the
/// joined extra-log tokens with spaces replaced by `%20`. `log` has no
/// NOTICE level, so this is emitted at `info`, the nearest standard
/// level above routine debug noise.
fn log_request(
    ctx: &WsgiContext,
    method: &str,
    path: &str,
    status: u16,
    request_bytes: usize,
    response_bytes: usize,
    duration: Duration,
) {
    let tokens = ctx
        .extra_log_tokens
        .iter()
        .map(|t| t.replace(' ', "%20"))
        .collect::<Vec<_>>()
        .join(" ");
    log::info!(
        "{} {} {} \"{} {}\" {} {}/{} {:.3}ms {}",
        ctx.request_id,
        ctx.sub_instance.sub_instance_name,
        ctx.request.peer,
        method,
        path,
        status,
        request_bytes,
        response_bytes,
        duration.as_secs_f64() * 1000.0,
        tokens
    );
}

/// Writes the response, returning `false` if the client had already gone
/// away (a broken-pipe style write error) so the caller can log the
/// disconnect without double-accounting the status (§10.7 (iii)).
fn write_wsgi_response(stream: &mut std::net::TcpStream, response: &crate::dispatch::WsgiResponse) -> bool {
    use std::io::Write;
    let status_text = status_reason(response.status);
    let mut out = format!("HTTP/1.1 {} {status_text}\r\n", response.status);
    for (k, v) in &response.headers {
        out.push_str(&format!("{k}: {v}\r\n"));
    }
    out.push_str(&format!("content-length: {}\r\n\r\n", response.body.len()));
    stream.write_all(out.as_bytes()).is_ok() && stream.write_all(&response.body).is_ok()
}

fn status_reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        404 => "Not Found",
        500 => "Internal Server Error",
        _ => "",
    }
}

/// Runs a TCP worker: the same single-threaded, poll-driven admission
/// loop as `run_wsgi`, but handed off to `TcpHandler::handle` whole once
/// a connection is readable (the handler owns framing for its own
/// protocol, so there is no generic partial-read state to resume here).
/// Replaces the previous `threadpool`-backed pool, which gave every
/// connection a real OS thread and so was genuine preemptive
/// concurrency, not the cooperative single-threaded model §5 specifies.
pub fn run_tcp(
    sub: &TcpSpec,
    listener: &TcpListener,
    region: &Arc<StatsRegion>,
    registry: &FactoryRegistry,
    worker_index: usize,
) -> i32 {
    let shutdown = ShutdownFlag::new();
    let _signals = crate::signal_handler::install_worker(shutdown.clone()).ok();

    let scope = super::WorkerRole::Tcp {
        sub_instance: sub.common.name.clone(),
        worker_index,
    }
    .scope();
    let stats = region.handle_for_scope(scope);
    stats.set("start_time", now_unix());

    let factory = match registry.tcp(&sub.handler.factory_path) {
        Ok(f) => f,
        Err(e) => {
            log::error!("tcp worker '{}' could not resolve its handler: {e}", sub.common.name);
            return 1;
        }
    };
    let handler = factory.build(&sub.handler.name, &sub.handler.parsed_conf);
    let handle = sub_instance_handle(&sub.common.name, worker_index);
    let max_inflight = sub.common.thread_pool_size.max(1);

    let mut pending: Vec<TcpStream> = Vec::new();
    let mut peers: Vec<SocketAddr> = Vec::new();
    while !shutdown.is_set() {
        while pending.len() < max_inflight {
            match listener.accept() {
                Ok((stream, peer)) => {
                    if stream.set_nonblocking(true).is_err() {
                        continue;
                    }
                    pending.push(stream);
                    peers.push(peer);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::warn!("tcp worker '{}' accept failed: {e}", sub.common.name);
                    break;
                }
            }
        }

        if pending.is_empty() {
            std::thread::sleep(Duration::from_millis(20));
            continue;
        }

        let ready = poll_readable(pending.iter(), 20);
        let mut next_streams = Vec::with_capacity(pending.len());
        let mut next_peers = Vec::with_capacity(peers.len());
        for (is_ready, (stream, peer)) in ready.into_iter().zip(pending.into_iter().zip(peers.into_iter())) {
            if !is_ready {
                next_streams.push(stream);
                next_peers.push(peer);
                continue;
            }
            stats.incr("request_count");
            handler.handle(&handle, &stats, stream, peer);
        }
        pending = next_streams;
        peers = next_peers;
    }
    0
}

pub fn run_udp(
    sub: &UdpSpec,
    socket: &UdpSocket,
    region: &Arc<StatsRegion>,
    registry: &FactoryRegistry,
    worker_index: usize,
) -> i32 {
    let shutdown = ShutdownFlag::new();
    let _signals = crate::signal_handler::install_worker(shutdown.clone()).ok();

    let scope = super::WorkerRole::Udp {
        sub_instance: sub.common.name.clone(),
        worker_index,
    }
    .scope();
    let stats = region.handle_for_scope(scope);
    stats.set("start_time", now_unix());

    let factory = match registry.udp(&sub.handler.factory_path) {
        Ok(f) => f,
        Err(e) => {
            log::error!("udp worker '{}' could not resolve its handler: {e}", sub.common.name);
            return 1;
        }
    };
    let handler = factory.build(&sub.handler.name, &sub.handler.parsed_conf);
    let handle = sub_instance_handle(&sub.common.name, worker_index);

    socket.set_nonblocking(true).ok();
    let mut buf = [0u8; 65536];
    while !shutdown.is_set() {
        match socket.recv_from(&mut buf) {
            Ok((n, peer)) => {
                stats.incr("request_count");
                handler.handle(&handle, &stats, socket, &buf[..n], peer);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(20));
            }
            Err(e) => log::warn!("udp worker '{}' recv failed: {e}", sub.common.name),
        }
    }
    0
}

pub fn run_daemon(daemon: &DaemonSpec, region: &Arc<StatsRegion>, registry: &FactoryRegistry) -> i32 {
    let shutdown = ShutdownFlag::new();
    let _signals = crate::signal_handler::install_worker(shutdown.clone()).ok();

    let scope = super::WorkerRole::Daemon {
        name: daemon.handler.name.clone(),
    }
    .scope();
    let stats = region.handle_for_scope(scope);
    stats.set("start_time", now_unix());

    let factory = match registry.daemon(&daemon.handler.factory_path) {
        Ok(f) => f,
        Err(e) => {
            log::error!("daemon '{}' could not resolve its body: {e}", daemon.handler.name);
            return 1;
        }
    };
    let body = factory.build(&daemon.handler.name, &daemon.handler.parsed_conf);
    let handle = sub_instance_handle(&daemon.handler.name, 0);
    body.run(&handle, &stats, &shutdown);
    0
}

//! Error kinds for every fallible subsystem (§7 of the spec).
//!
//! Each kind gets its own small enum with a hand-written `Display`, the
//! same convention the rest of this codebase uses for `RunCmdError` and
//! `ParsingErrorReason`-style errors: no `anyhow`, no `thiserror`.

use std::fmt;

#[derive(Debug, Clone)]
pub enum ConfigError {
    Io(String),
    SectionTooOften(String),
    MissingRequired { section: String, key: String },
    UnknownOption { section: String, key: String },
    BadValue { section: String, key: String, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(msg) => write!(f, "could not read config: {msg}"),
            Self::SectionTooOften(s) => write!(f, "section [{s}] appears more than once"),
            Self::MissingRequired { section, key } => {
                write!(f, "[{section}] missing required option '{key}'")
            }
            Self::UnknownOption { section, key } => {
                write!(f, "[{section}] unknown option '{key}'")
            }
            Self::BadValue { section, key, value } => {
                write!(f, "[{section}] option '{key}' has invalid value '{value}'")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone)]
pub struct BindError {
    pub address: String,
    pub port: u16,
    pub attempts: u32,
    pub os_error: String,
}

impl fmt::Display for BindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "failed to bind {}:{} after {} attempt(s): {}",
            self.address, self.port, self.attempts, self.os_error
        )
    }
}

impl std::error::Error for BindError {}

#[derive(Debug, Clone)]
pub enum PrivilegeError {
    UnknownUser(String),
    UnknownGroup(String),
    SetGid(String),
    SetUid(String),
    Umask(String),
}

impl fmt::Display for PrivilegeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownUser(u) => write!(f, "no such user: {u}"),
            Self::UnknownGroup(g) => write!(f, "no such group: {g}"),
            Self::SetGid(e) => write!(f, "setgid failed: {e}"),
            Self::SetUid(e) => write!(f, "setuid failed: {e}"),
            Self::Umask(e) => write!(f, "invalid umask: {e}"),
        }
    }
}

impl std::error::Error for PrivilegeError {}

#[derive(Debug, Clone)]
pub enum PidfileError {
    AlreadyRunning { path: String, pid: i32 },
    Write { path: String, reason: String },
    Read { path: String, reason: String },
}

impl fmt::Display for PidfileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyRunning { path, pid } => {
                write!(f, "pidfile {path} names a live process (pid {pid})")
            }
            Self::Write { path, reason } => write!(f, "could not write pidfile {path}: {reason}"),
            Self::Read { path, reason } => write!(f, "could not read pidfile {path}: {reason}"),
        }
    }
}

impl std::error::Error for PidfileError {}

/// Raised by a factory's `parse_conf`/`stats_conf` hook. The message is
/// surfaced unchanged, as the spec requires.
#[derive(Debug, Clone)]
pub struct FactoryInitError {
    pub factory: String,
    pub message: String,
}

impl fmt::Display for FactoryInitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for FactoryInitError {}

/// Raised by a handler's request/task invocation. Logged at ERROR with
/// the request id; never fatal to the worker.
#[derive(Debug, Clone)]
pub struct HandlerRuntimeError {
    pub handler: String,
    pub message: String,
}

impl fmt::Display for HandlerRuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler '{}' failed: {}", self.handler, self.message)
    }
}

impl std::error::Error for HandlerRuntimeError {}

/// Raised when the `fern` dispatch for the log sink fails to set up
/// (bad log file path, sink already initialized).
#[derive(Debug, Clone)]
pub struct LoggingError {
    pub message: String,
}

impl fmt::Display for LoggingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "could not open log sink: {}", self.message)
    }
}

impl std::error::Error for LoggingError {}

/// A worker/daemon child exited in a way that was not a cooperative
/// shutdown. Never fatal to the supervisor; triggers the §4.2 restart.
#[derive(Debug, Clone)]
pub struct WorkerCrash {
    pub scope: String,
    pub detail: String,
}

impl fmt::Display for WorkerCrash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} crashed: {}", self.scope, self.detail)
    }
}

impl std::error::Error for WorkerCrash {}

/// Top-level error surfaced by the CLI. Pre-fork errors use this to
/// produce the `[<section>] <message>` line from §7.
#[derive(Debug, Clone)]
pub enum LauncherError {
    Config(ConfigError),
    Bind(BindError),
    Privilege(PrivilegeError),
    Pidfile(PidfileError),
    FactoryInit(FactoryInitError),
    Logging(LoggingError),
}

impl LauncherError {
    /// The bracketed section tag used in the single-line error report.
    #[must_use]
    pub fn section_tag(&self) -> &str {
        match self {
            Self::Config(_) => "conf",
            Self::Bind(_) => "listener",
            Self::Privilege(_) => "brim",
            Self::Pidfile(_) => "brim",
            Self::FactoryInit(e) => &e.factory,
            Self::Logging(_) => "brim",
        }
    }
}

impl fmt::Display for LauncherError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => write!(f, "[{}] {e}", self.section_tag()),
            Self::Bind(e) => write!(f, "[{}] {e}", self.section_tag()),
            Self::Privilege(e) => write!(f, "[{}] {e}", self.section_tag()),
            Self::Pidfile(e) => write!(f, "[{}] {e}", self.section_tag()),
            Self::FactoryInit(e) => write!(f, "[{}] {e}", self.section_tag()),
            Self::Logging(e) => write!(f, "[{}] {e}", self.section_tag()),
        }
    }
}

impl std::error::Error for LauncherError {}

impl From<ConfigError> for LauncherError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}
impl From<BindError> for LauncherError {
    fn from(e: BindError) -> Self {
        Self::Bind(e)
    }
}
impl From<PrivilegeError> for LauncherError {
    fn from(e: PrivilegeError) -> Self {
        Self::Privilege(e)
    }
}
impl From<PidfileError> for LauncherError {
    fn from(e: PidfileError) -> Self {
        Self::Pidfile(e)
    }
}
impl From<FactoryInitError> for LauncherError {
    fn from(e: FactoryInitError) -> Self {
        Self::FactoryInit(e)
    }
}
impl From<LoggingError> for LauncherError {
    fn from(e: LoggingError) -> Self {
        Self::Logging(e)
    }
}

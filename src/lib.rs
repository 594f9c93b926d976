pub mod cli;
pub mod config;
pub mod daemonize;
pub mod demos;
pub mod dispatch;
pub mod error;
pub mod listener;
pub mod logging;
pub mod pidfile;
pub mod plan;
pub mod platform;
pub mod privilege;
pub mod signal_handler;
pub mod stats;
pub mod supervisor;

#[cfg(test)]
mod tests;

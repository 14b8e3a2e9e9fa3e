//! wiotp-agent: a long-running device agent for the Watson IoT Platform
//!
//! The agent connects as a registered device with `wiotp-sdk`, logs the
//! commands the platform sends it and publishes a status event on a fixed
//! interval until it is stopped.
//!
//! ## Modules
//!
//! * `config`: TOML configuration for the logger, the device identity and
//!   the agent itself, validated with `validator` when loaded.
//!
//! * `logger`: installs the global `tracing` subscriber. Console output
//!   comes in compact, pretty or JSON form, with optional systemd journald.
//!
//! * `agent`: the status publishing loop.

pub mod agent;
pub mod config;
pub mod logger;

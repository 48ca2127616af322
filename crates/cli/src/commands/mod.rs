//! Subcommand implementations

pub mod config;
pub mod loopback;
pub mod probe_mic;

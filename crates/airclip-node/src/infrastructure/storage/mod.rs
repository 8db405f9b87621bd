//! Storage infrastructure: configuration file persistence.
//!
//! The `config` sub-module reads the TOML configuration file from the
//! platform-appropriate directory (or an explicit path), fills in defaults
//! for anything missing, and converts it into the runtime settings consumed
//! by the network services.

pub mod config;

//! tfarmd library
//!
//! Core functionality for the tfarm daemon:
//! - Credential provisioning store with a blocking wait
//! - frpc configuration rendering, parsing and identity signing
//! - frpc process supervision with auto-restart
//! - Tunnel fragment transactions (verify-before-reload)
//! - Mutually-authenticated HTTPS management API

pub mod credentials;
pub mod frpc;
pub mod server;
pub mod tracing_init;

//! Everything about the managed frpc process: its configuration file, its
//! lifecycle, its admin-endpoint status, and its tunnel fragments.

pub mod config;
pub mod status;
pub mod supervisor;
pub mod tunnels;

pub use supervisor::{FrpcSupervisor, SupervisorError};

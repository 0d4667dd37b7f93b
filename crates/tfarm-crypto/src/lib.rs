//! Crypto primitives for tfarm.
//!
//! - Local certificate authority: root generation and server/client leaf
//!   issuance for the daemon's mutually-authenticated API.
//! - Config signatures: the HMAC-SHA256 identity signature injected into the
//!   managed frpc configuration.
//! - [`store::CertStore`]: PEM file round-trips for the `tls/` directory.

pub mod certs;
pub mod signature;
pub mod store;

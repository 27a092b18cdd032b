//! PhantomDNS: a local DNS router that forwards ordinary queries to
//! upstream nameservers and resolves a configured set of domain suffixes
//! through ephemeral remote workers, answering with synthesized loopback
//! addresses for a cooperating local transport layer.

pub mod classify;
pub mod config;
pub mod engine;
pub mod server;
pub mod session;
pub mod upstream;
pub mod worker;

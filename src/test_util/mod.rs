//! In-memory implementations of the collaborator contracts in [crate::provider]. They are used
//!  for testing the socket layer itself, and they are exported so that applications can test
//!  code built on top of proxy sockets without a registry or proxies.

pub mod control_channel;
pub mod name_service;
pub mod stream_service;

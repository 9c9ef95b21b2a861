//! pingbff is a backend-for-frontend aggregation server built on pingora.
//!
//! Each client request names an operation and a client profile. The
//! operation's plan fans out to upstream core services, with retries and
//! circuit breaking per service, and the normalized results are merged
//! and shaped into one payload for that profile.

#![allow(clippy::upper_case_acronyms)]

pub mod config;
pub mod core;
pub mod logging;
pub mod proxy;
pub mod service;
pub(crate) mod utils;

//! secspot agent process: settings loading and the local HTTP API

pub mod api;
pub mod config;

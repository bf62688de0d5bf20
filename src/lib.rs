#![allow(clippy::result_large_err)]

pub mod app;
pub mod config;
pub mod error;
pub mod logging;
pub mod management;
pub mod metrics;
pub mod readiness;
pub mod registry;
pub mod retry;
pub mod runtime;
pub mod supervisor;
pub mod telemetry;

pub mod adb;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod orchestrator;
pub mod rpc;
pub mod scheduler;
pub mod station;

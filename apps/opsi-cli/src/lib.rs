pub mod app;
pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod output;
pub mod service;
pub mod telemetry;
pub mod transport;

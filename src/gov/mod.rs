pub mod build_info;
pub mod child;
pub mod cli;
pub mod client;
pub mod config;
pub mod governator;
pub mod logger;
pub mod reaper;
pub mod server;
pub mod service;
pub mod watchdog;
pub mod watcher;

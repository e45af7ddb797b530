#![deny(rust_2018_idioms)]

pub mod alerts;
pub mod cluster;
pub mod config;
pub mod daemon;
pub mod dispatch;
pub mod error;
pub mod http_server;
pub mod inhibit;
pub mod labels;
pub mod marker;
pub mod matchers;
pub mod metrics;
pub mod nflog;
pub mod notify;
pub mod route;
pub mod silences;
pub mod templates;

pub use cluster::ClusterConfig;
pub use config::Config;
pub use daemon::{DaemonConfig, run};

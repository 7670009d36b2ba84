pub mod app;
pub mod client;
pub mod config;
pub mod db;
pub mod exit;
pub mod logging;
pub mod protocol;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod sums;

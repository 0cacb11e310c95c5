pub mod config;
pub mod creator;
pub mod error;
pub mod loader;
pub mod metrics_consts;
pub mod processor;
pub mod source;
pub mod worker;

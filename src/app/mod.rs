pub mod adb;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod groups;
pub mod logcat;
pub mod logging;
pub mod models;
pub mod monitor;
pub mod prober;
pub mod transport;
pub mod worker;

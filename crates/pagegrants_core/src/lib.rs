pub mod apply;
pub mod client;
pub mod config;
pub mod logging;
pub mod manifest;
pub mod security;

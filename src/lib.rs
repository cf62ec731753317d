pub mod config;
pub mod error;
pub mod http;
pub mod ids;
pub mod session;
pub mod version;

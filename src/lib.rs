pub mod board;
pub mod client;
pub mod config;
pub mod context;
pub mod errors;
pub mod forms;
pub mod hooks;
pub mod logging;
pub mod notion;
pub mod server;
pub mod session;

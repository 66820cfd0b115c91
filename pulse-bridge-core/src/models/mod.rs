pub mod config;
pub mod error;
pub mod sample;
pub mod server_info;
pub mod state;

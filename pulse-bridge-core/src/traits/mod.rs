pub mod native_api;
pub mod simple_api;

pub mod classroom;
pub mod config;
pub mod error;
pub mod types;

pub mod auth;
pub mod config;
pub mod crypto;
pub mod error;
pub mod health;
pub mod jobs;
pub mod models;
pub mod routes;
pub mod server;
pub mod shutdown;
pub mod storage;
pub mod test_utils;

pub use config::Config;
pub use server::Server;

pub mod caches;
pub mod config;
pub mod consumer;
pub mod database;
pub mod dispatcher;
pub mod error;
pub mod inbox;
pub mod models;
pub mod monitor;
pub mod node;
pub mod routes;
pub mod server_registry;
pub mod store;
pub mod task_log;
pub mod task_types;

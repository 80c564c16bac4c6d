pub mod config;
pub mod db;
pub mod engine;
pub mod mirror;
pub mod models;
pub mod server;
pub mod service;
pub mod store;
pub mod structure;
pub mod transport;

#[cfg(test)]
mod testing;

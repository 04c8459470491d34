pub mod api;
pub mod config;
pub mod db;
pub mod engine;
pub mod mqtt;
pub mod notify;
pub mod scheduler;
pub mod status_store;
pub mod tasks;

#[cfg(test)]
pub(crate) mod testing;

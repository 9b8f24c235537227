pub mod config;
pub mod data_loader;
pub mod ingest;
pub mod mappings;

pub mod database;
pub mod services;

pub mod agents;
pub mod config;
pub mod db;
pub mod models;
pub mod responses;
pub mod routes;
pub mod services;
pub mod state;
pub mod usage;
pub mod utils;
pub mod worker;

pub mod classifier;
pub mod config;
pub mod context;
pub mod db;
pub mod pipeline;
pub mod routes;
pub mod storage;

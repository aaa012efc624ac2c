pub mod chain;
pub mod config;
pub mod db;
pub mod extract;
pub mod ledger;
pub mod models;
pub mod pipeline;
pub mod query;

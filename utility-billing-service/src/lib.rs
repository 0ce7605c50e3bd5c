pub mod config;
pub mod error;
pub mod handlers;
pub mod ledger;
pub mod models;
pub mod services;
pub mod startup;
pub mod store;

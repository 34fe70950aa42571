pub mod assignment;
pub mod config;
pub mod distributor;
pub mod election;
pub mod error;
pub mod leader;
pub mod manager;
pub mod retry;
pub mod store;

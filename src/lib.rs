pub mod aggregator;
pub mod collaborators;
pub mod config;
pub mod context;
pub mod error;
pub mod reclaimer;
pub mod registry;
pub mod scheduler;
pub mod service;
pub mod shutdown;
pub mod store;
pub mod worker;

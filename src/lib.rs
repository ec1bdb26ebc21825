pub mod channel;
pub mod condition;
pub mod config;
pub mod flow;
pub mod graph;
pub mod logger;
pub mod message;
pub mod schema;
pub mod service;
pub mod state;

// MoE Router - routes typed requests to expert services and aggregates their answers

pub mod config;
pub mod orchestration;
pub mod server;

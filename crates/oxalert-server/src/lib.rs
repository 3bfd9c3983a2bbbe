pub mod config;
pub mod evaluator;
pub mod http;
pub mod rule_seed;
pub mod scheduler;

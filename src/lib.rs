pub mod broker;
pub mod config;
pub mod error;
pub mod generation;
pub mod ollama;
pub mod pending;
pub mod prompt;
pub mod protocol;
pub mod rate_limit;
pub mod reaper;
pub mod registry;
pub mod selector;
pub mod server;
pub mod worker_agent;
pub mod worker_http;

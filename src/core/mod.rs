pub mod agent;
pub mod chunks;
pub mod encoder;
pub mod envelope;
pub mod error;
pub mod lifecycle;
pub mod orchestrator;
pub mod resolver;
pub mod run;
pub mod store;
pub mod terminal;

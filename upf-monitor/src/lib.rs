pub mod agent;
pub mod config;
pub mod events;
pub mod hosted;
pub mod loader;
pub mod sessions;
pub mod stats;

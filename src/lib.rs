pub mod agent;
pub mod channel;
pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod plugin;
pub mod refs;
pub mod registry;
pub mod server;
pub mod symbols;

pub use config::Config;
pub use error::{ArtscopeError, Result};
pub use server::{serve, App};

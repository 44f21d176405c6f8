pub mod background;
pub mod capability;
pub mod cli;
pub mod delivery;
pub mod error;
pub mod foreground;
pub mod logging;
pub mod monitor;
pub mod notification;
pub mod persist;
pub mod push;
pub mod runtime;
pub mod scheduler;
pub mod settings;
pub mod store;
pub mod types;

#[cfg(test)]
mod testing;

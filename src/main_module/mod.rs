//! Process startup: logging, config, database, provider clients and the
//! HTTP listener.

mod bootstrap;
mod health;
mod server;

pub use bootstrap::*;
pub use health::*;
pub use server::*;

#[macro_use]
extern crate error_chain;
#[macro_use]
extern crate serde_derive;

pub mod clock;
pub mod config;
pub mod consensus;
pub mod errors;
pub mod messages;
pub mod server;
pub mod state;
pub mod state_machine;
pub mod store;
pub mod transport;
pub mod types;

pub mod config;
pub mod error;
pub mod listener;
pub mod poll;
pub mod system;
pub mod table;
pub mod tarpit;

pub use config::{Config, Endpoint};
pub use error::{Error, Result};
pub use tarpit::{Tarpit, Turn};

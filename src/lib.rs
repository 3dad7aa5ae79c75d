pub mod account;
pub mod config;
pub mod error;
pub mod logging;
pub mod probe;
pub mod upstream;
pub mod usage;
pub mod util;

#[cfg(test)]
mod testing;

#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::pedantic
)]
#![forbid(unsafe_code)]

mod client;
pub mod config;
pub mod error;
mod interceptor;
mod manager;
pub mod provider;
pub mod retry;
mod scheduler;
pub mod store;
#[cfg(test)]
mod testing;

pub use client::*;
pub use config::{ClientCredentials, TokenConfig};
pub use error::{Error, Result};
pub use interceptor::*;
pub use manager::*;
pub use provider::{HttpTokenProvider, TokenProvider, TokenRecord};
pub use scheduler::*;
#[cfg(feature = "redis")]
pub use store::RedisTokenStore;
pub use store::{MemoryTokenStore, TokenStore};

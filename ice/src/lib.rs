#![warn(rust_2018_idioms)]

pub mod agent;
pub mod attributes;
pub mod candidate;
mod error;
pub mod external_ip_mapper;
pub mod mdns;
pub mod network_type;
pub mod rand;
pub mod state;
pub mod stats;
pub mod stream_conn;
pub mod url;

pub use error::Error;

pub mod batch;
pub mod config;
pub mod error;
pub mod filter;
pub mod import;
pub mod merge;
pub mod node;
pub mod view;

pub use error::{Error, Result};

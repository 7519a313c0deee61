pub mod config;
pub mod error;
pub mod model;
pub mod time;

pub use error::{Result, ScrapeError};

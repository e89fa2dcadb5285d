pub mod cyclegan;
pub mod data;
pub mod error;
pub mod metrics;
pub mod model;
pub mod server;
pub mod training;
pub mod utils;

pub use error::{Error, Result};

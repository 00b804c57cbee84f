pub mod error;
pub mod ops;
pub mod timings;
pub mod utils;

pub use error::Error;
pub use timings::{Timings, TimingsSnapshot};

/// A type alias for `Result<T, Error>` for the `batchline` crates.
pub type Result<T> = std::result::Result<T, Error>;

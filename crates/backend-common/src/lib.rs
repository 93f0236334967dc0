pub mod error;

pub use error::{BackendError, Result};

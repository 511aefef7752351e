//! Common utilities and types

pub mod error;
pub mod net;
pub mod url;

pub use error::{Error, Result};
pub use url::{CompleteUrl, Scheme};

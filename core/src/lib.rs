pub mod auth;
pub mod db;
pub mod error;
pub mod media;
pub mod models;

pub use error::{Error, Result};

//! Database module for the Beacon Network.
//!
//! Provides SQLite storage with embedded migrations.

mod models;
mod store;
mod traits;

pub use models::*;
pub use store::*;
pub use traits::*;

pub mod config;
pub mod destination;
pub mod error;
pub mod frame;
pub mod header;
pub mod timeouts;

pub use config::*;
pub use destination::*;
pub use error::*;
pub use frame::*;
pub use header::*;
pub use timeouts::*;

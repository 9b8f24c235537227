pub mod connection;
pub mod entities;
pub mod migrations;
pub mod store;

pub use connection::*;
pub use store::*;

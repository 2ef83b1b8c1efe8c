pub mod config;
pub mod magic_packet;
pub mod messages;

pub use config::*;
pub use magic_packet::*;
pub use messages::*;

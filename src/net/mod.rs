//! Wire protocol: frame definitions and connection plumbing.

pub mod message;
pub mod wire;

pub use message::{Message, WireError};
pub use wire::{connect, exchange, send_oneshot, spawn_writer, write_frame, FrameReader};

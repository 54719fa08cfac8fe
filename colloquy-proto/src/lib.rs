//! Message model and wire formats shared by the Colloquy engine.

pub mod codec;
pub mod event;
pub mod message;
pub mod wire;

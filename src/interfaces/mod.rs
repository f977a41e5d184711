//! The three interfaces: public, flipped, pulled.

pub mod flipped;
pub mod public;
pub mod pulled;

pub use flipped::FlippedInterface;
pub use public::PublicInterface;
pub use pulled::PulledInterface;

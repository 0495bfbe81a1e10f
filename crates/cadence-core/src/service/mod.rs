//! Small service abstractions injected into the engine and stores.

pub mod clock;
pub mod hash;

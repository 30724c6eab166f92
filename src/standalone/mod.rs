//! Process-level pieces: the HTTP front door, the supervisor that runs it,
//! and the stdio bridge that talks to it from the outside.

pub mod front_door;
pub mod stdio_bridge;
pub mod supervisor;

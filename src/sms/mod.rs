//! Inbound text handling: the reply pipeline, outbound delivery and the
//! notifications fanned out around them.

pub mod delivery;
pub mod notify;
pub mod reply;

//! Context injected into agent prompts: knowledge-base chunks, per-contact
//! memory and the prompt text around them.

pub mod knowledge;
pub mod memory;
pub mod prompt;

pub mod client;
pub mod webhook;

pub use client::{SmsError, SmsGateway};

/// Empty LaML document. SignalWire treats it as "no further action".
pub const EMPTY_LAML: &str = r#"<?xml version="1.0" encoding="UTF-8"?><Response></Response>"#;

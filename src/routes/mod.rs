//! HTTP route handlers.
//!
//! Agent command routes require the security key, a whitelisted client IP and
//! the optional access window. The proxy checks the IP on every route and the
//! window on forwarded ones. [`health`] is open on both roles.

pub mod cmd;
pub mod health;
pub mod targets;

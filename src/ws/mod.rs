//! WebSocket endpoints served by the agent.
//!
//! - `GET /api/cmd/output?task_id=<id>` ([`output`]): observe a task's output.
//!   Each line is one text frame; the end of the task is a normal close frame
//!   whose reason names the outcome.
//! - `GET /api/cmd/script` ([`script`]): stream a script into a fresh shell
//!   using the JSON protocol documented in that module.

pub mod output;
pub mod script;

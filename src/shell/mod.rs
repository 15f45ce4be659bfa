//! Shell process management.
//!
//! - **Tasks** ([`process::spawn_command`]): `<shell> -c <command>`, output
//!   broadcast to observers.
//! - **Script sessions** ([`process::spawn_script_shell`]): `<shell> -s` fed
//!   from a WebSocket.

pub mod process;

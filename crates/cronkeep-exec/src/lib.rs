//! cronkeep-exec: process spawning for scheduled shell commands.
//!
//! Two execution modes, both with captured stdout/stderr and an optional
//! wall-clock timeout:
//! - `run`: spawn and wait for completion
//! - `start`: spawn and return a [`ProcessHandle`] to be awaited later
//!
//! # Quick start
//!
//! ```rust,no_run
//! use cronkeep_exec::{CommandLine, ExecOptions, ProcessSpawner, TokioSpawner};
//!
//! #[tokio::main]
//! async fn main() {
//!     let spawner = TokioSpawner::new();
//!     let cmd = CommandLine::new("echo", vec!["hello".into()]);
//!     let result = spawner.run(&cmd, &ExecOptions::default()).await.unwrap();
//!     println!("{}", result.stdout);
//! }
//! ```

pub mod error;
pub mod spawner;
pub mod types;

pub use error::{ExecError, Result};
pub use spawner::{ProcessSpawner, TokioSpawner};
pub use types::{CommandLine, ExecOptions, ExecResult, ProcessHandle};

//! Execution boundary.
//!
//! The build engine hands each step of a rule to a [`StepExecutor`] and only
//! looks at the terminal [`StepResult`].

mod shell;
mod types;

pub use shell::{ShellStepExecutor, TMP_DIR_NAME};
pub use types::{Step, StepContext, StepExecutor, StepResult};

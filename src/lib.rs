//! Execution core for the kelp shell.
//!
//! Takes an already parsed command tree, brace expands its words, and runs
//! it as processes wired together with pipes and redirections. Descriptor
//! and variable state is scoped so that every construct leaves the shell as
//! it found it.

pub mod prelude;

pub mod ast;
pub mod execute;
pub mod expand;
pub mod jobs;
pub mod libsh;
pub mod procio;
pub mod shopt;
pub mod state;

#[cfg(test)]
pub mod tests;

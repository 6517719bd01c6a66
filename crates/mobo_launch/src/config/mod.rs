//! Launch file configuration, substitutions, conditions and document rewriting

mod condition;
mod launch_file;
mod rewrite;
mod store;
mod substitution;

pub use condition::*;
pub use launch_file::*;
pub use rewrite::*;
pub use store::*;
pub use substitution::*;

//! Runtime components: action graph, executor and process supervision

pub mod executor;
pub mod graph;
pub mod process;
pub mod scope;
pub mod state;
pub mod supervisor;

pub use executor::*;
pub use graph::*;
pub use process::*;
pub use scope::*;
pub use state::*;
pub use supervisor::*;

//! Adapters to the collaborators outside the controller: the git source,
//! the target cluster and the status sinks

mod cluster;
mod manifests;
mod memory;
mod source;
mod status;

pub use cluster::*;
pub use manifests::*;
pub use memory::*;
pub use source::*;
pub use status::*;

//! Fixtures and recording collaborators shared by Trellis tests.

mod fixtures;
mod recording;

pub use fixtures::*;
pub use recording::*;

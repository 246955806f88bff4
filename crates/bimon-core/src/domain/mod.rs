//! Core domain types shared by the store, packer and bisection engine.

pub mod commit;
pub mod error;
pub mod status;

pub use commit::{CommitId, Mark};
pub use error::{BimonError, Result};
pub use status::{ArtifactLocation, BuildStatus};

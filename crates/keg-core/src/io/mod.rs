pub mod cache;
pub mod download;
pub mod extract;
pub mod git;

pub use cache::{ArtifactCache, FetchError, FetchedSource, RetryPolicy};

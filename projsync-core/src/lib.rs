mod client;
mod entry;

pub use client::{ApiErrorClass, ProjectMetadata, ProjsyncError, StoreClient};
pub use entry::FileEntry;

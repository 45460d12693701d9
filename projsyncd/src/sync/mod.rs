pub mod classify;
pub mod engine;
pub mod fs_store;
pub mod local_watcher;
pub mod paths;
pub mod queue;
pub mod scheduler;
pub mod status;
pub mod store;
pub mod transmitter;
pub mod vfs;

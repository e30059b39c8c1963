pub mod list;
pub mod snapshot;
pub mod upload;

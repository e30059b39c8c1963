pub mod bufpool;
pub mod command;
pub mod context;
pub mod error;
pub mod hash;
pub mod ignore;
pub mod metadata;
pub mod progress;
pub mod reader;
pub mod settings;
pub mod storage;

pub use error::{Error, Result};

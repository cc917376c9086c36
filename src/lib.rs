//! cloudenv - cloud object storage for an embedded storage engine
//!
//! cloudenv lets an LSM-style storage engine keep its files in an object store:
//! - Bucket descriptors naming a source and a destination location
//! - Pluggable storage providers (Amazon S3, in-memory) behind one trait
//! - Readable and writable object handles with the engine's file interfaces
//! - A cloud environment with a background purger for unreferenced objects

pub mod bucket;
pub mod config;
pub mod env;
pub mod error;
pub mod file;
pub mod path;
pub mod provider;
pub mod retry;

pub use error::{Error, ErrorKind, Result};

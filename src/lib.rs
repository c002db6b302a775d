//! A disk-backed read/write cache for content-addressed block stores.
//!
//! [`DiskCache`] decorates an upstream [`BlockGateway`]: reads are
//! served from a local cache directory when possible and filled from
//! the upstream when not, writes pass through while a copy is retained
//! opportunistically, and a background "tidy" pass keeps the directory
//! under a size budget by evicting the least-recently-accessed blocks.
//! The cache is itself a [`BlockGateway`], so caches stack, and
//! cooperating processes may share one cache directory: all
//! coordination happens through advisory file locks.
mod cache;
mod error;
mod flock;
mod fsutil;
mod gateway;
mod heldopen;
mod layout;
mod locator;
mod tidy;

pub use cache::DiskCache;
pub use error::{Error, Result};
pub use gateway::{BlockGateway, WriteOptions, WriteResponse};
pub use layout::{CACHE_FILE_SUFFIX, TMP_FILE_SUFFIX};
pub use locator::Locator;

//! Everything the cache can report to its callers.  Upstream gateways
//! return the same [`Error`] type, so a [`crate::DiskCache`] surfaces
//! upstream failures verbatim and decorators stack without translation
//! layers.
use std::io;

use thiserror::Error;

/// Errors surfaced by cache operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A local or upstream I/O failure.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// The bytes written through the cache did not hash to the value the
    /// caller promised.  The upstream may still have accepted the write;
    /// the cache refuses to commit a local copy either way.
    #[error("block hash {actual} did not match provided hash {expected}")]
    HashMismatch { expected: String, actual: String },

    /// The byte count written through the cache did not match the size
    /// the caller promised.
    #[error("block size {actual} did not match provided size {expected}")]
    SizeMismatch { expected: u64, actual: u64 },

    /// The locator is malformed: a missing or unparseable size hint, or a
    /// hash too short to derive a cache path from.
    #[error("invalid block locator: {0}")]
    InvalidLocator(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A locator parsing error should be cheap to test for.
#[test]
fn test_display() {
    assert_eq!(
        Error::HashMismatch {
            expected: "aaaa".to_owned(),
            actual: "bbbb".to_owned(),
        }
        .to_string(),
        "block hash bbbb did not match provided hash aaaa"
    );
    assert_eq!(
        Error::SizeMismatch {
            expected: 16,
            actual: 10,
        }
        .to_string(),
        "block size 10 did not match provided size 16"
    );
    assert_eq!(
        Error::InvalidLocator("no size hint").to_string(),
        "invalid block locator: no size hint"
    );
}

/// I/O errors convert transparently, including their kind.
#[test]
fn test_io_conversion() {
    let err: Error = io::Error::new(io::ErrorKind::NotFound, "gone").into();
    assert!(matches!(&err, Error::Io(e) if e.kind() == io::ErrorKind::NotFound));
}

//! The gateway seam.  A [`BlockGateway`] is anything that can serve
//! immutable content-addressed blocks: a remote block-store client, or a
//! [`crate::DiskCache`] wrapped around one.  The cache implements the
//! same four operations it consumes, so gateways stack like decorators
//! and callers never care how many cache layers sit between them and the
//! store.
use std::io::{Read, Write};

use derivative::Derivative;

use crate::error::Result;

/// A client for an upstream block store.
///
/// All four operations are synchronous and safe to call from unrelated
/// threads.  Implementations must not retain the `reader` passed in
/// [`WriteOptions`] beyond the `block_write` call.
pub trait BlockGateway: Send + Sync {
    /// Copies bytes `[offset, offset + dst.len())` of the block named by
    /// `locator` into `dst`.  Returns the number of bytes read.
    fn read_at(&self, locator: &str, dst: &mut [u8], offset: u64) -> Result<usize>;

    /// Streams the entire block named by `locator` into `sink`.
    /// Returns the number of bytes written.
    fn block_read(&self, locator: &str, sink: &mut dyn Write) -> Result<usize>;

    /// Writes a block and returns its assigned locator.
    fn block_write(&self, opts: WriteOptions<'_>) -> Result<WriteResponse>;

    /// Exchanges a possibly remote-signed locator for a local one.
    fn local_locator(&self, locator: &str) -> Result<String>;
}

/// Options for [`BlockGateway::block_write`].
///
/// Exactly one of `data` and `reader` should be set; `data` wins when
/// both are.  The remaining fields are forwarded to the upstream store.
#[derive(Default, Derivative)]
#[derivative(Debug)]
pub struct WriteOptions<'a> {
    /// The block contents, as a buffer.
    pub data: Option<&'a [u8]>,

    /// The block contents, as a stream.
    #[derivative(Debug = "ignore")]
    pub reader: Option<Box<dyn Read + Send + 'a>>,

    /// Expected byte count.  A write whose source yields a different
    /// number of bytes fails with a size-mismatch error.
    pub data_size: Option<u64>,

    /// Expected lowercase hex content hash.  A write whose source
    /// hashes differently fails with a hash-mismatch error.
    pub hash: Option<String>,

    /// Requested replica count, forwarded to the upstream store.
    pub replicas: Option<u32>,

    /// Requested storage classes, forwarded to the upstream store.
    pub storage_classes: Vec<String>,
}

impl<'a> WriteOptions<'a> {
    /// Returns options writing the given buffer.
    pub fn from_data(data: &'a [u8]) -> WriteOptions<'a> {
        WriteOptions {
            data: Some(data),
            ..Default::default()
        }
    }

    /// Returns options writing `data_size` bytes streamed from `reader`.
    pub fn from_reader(reader: impl Read + Send + 'a, data_size: u64) -> WriteOptions<'a> {
        WriteOptions {
            reader: Some(Box::new(reader)),
            data_size: Some(data_size),
            ..Default::default()
        }
    }

    /// Sets the expected content hash.
    pub fn expect_hash(mut self, hash: impl Into<String>) -> WriteOptions<'a> {
        self.hash = Some(hash.into());
        self
    }
}

/// A successful [`BlockGateway::block_write`] response.
#[derive(Clone, Debug, Default)]
pub struct WriteResponse {
    /// The locator assigned to the written block.
    pub locator: String,

    /// How many replicas the store reports holding.
    pub replicas: u32,
}

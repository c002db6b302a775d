//! The disk cache itself: a [`BlockGateway`] decorator that serves
//! reads from local disk when it can, fills from the upstream when it
//! can't, and opportunistically retains blocks written through it.  All
//! cache trouble degrades to pass-through; the only errors a caller
//! sees that the upstream didn't produce are the ones that protect
//! correctness (hash/size mismatches, malformed locators, and lock
//! failures on an already-open cache file).
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;

use md5::{Digest, Md5};
use tracing::debug;

use crate::error::{Error, Result};
use crate::flock;
use crate::fsutil::{open_or_create, read_full_at, rename_with_parent, rw_create_options};
use crate::gateway::{BlockGateway, WriteOptions, WriteResponse};
use crate::heldopen::HeldopenPool;
use crate::layout;
use crate::locator::Locator;
use crate::tidy::Scheduler;

/// A disk-backed cache layered over an upstream [`BlockGateway`].
///
/// The cache is itself a gateway, so caches stack: a fast local
/// directory in front of a slower shared one in front of the remote
/// store.  Sibling processes may share a cache directory as long as
/// they use the same layout constants; coordination happens through
/// advisory file locks.
#[derive(Debug)]
pub struct DiskCache<G> {
    inner: G,
    dir: PathBuf,
    max_size: u64,
    heldopen: HeldopenPool,
    tidy: Scheduler,
}

/// Writes everything to both sinks, like the fill path's "populate the
/// cache file while streaming to the caller".
struct TeeWriter<A, B> {
    a: A,
    b: B,
}

impl<A: Write, B: Write> Write for TeeWriter<A, B> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.a.write_all(buf)?;
        self.b.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.a.flush()?;
        self.b.flush()
    }
}

fn io_context(path: &Path, op: &str, e: io::Error) -> Error {
    Error::Io(io::Error::new(
        e.kind(),
        format!("{}({}) failed: {}", op, path.display(), e),
    ))
}

fn hex_digest(hasher: Md5) -> String {
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

impl<G: BlockGateway> DiskCache<G> {
    /// Returns a cache over `inner`, storing blocks under `dir`.
    ///
    /// `dir` must exist or be creatable by whoever writes first; the
    /// cache itself only creates the subdirectories it needs, lazily.
    /// An unusable directory is not an error here; every operation
    /// falls back to the upstream instead.
    pub fn new(inner: G, dir: impl Into<PathBuf>) -> DiskCache<G> {
        DiskCache {
            inner,
            dir: dir.into(),
            max_size: 0,
            heldopen: HeldopenPool::new(),
            tidy: Scheduler::new(),
        }
    }

    /// Caps on-disk usage at `bytes`.  Zero (the default) derives a cap
    /// from the filesystem's free space on the first eviction pass.
    pub fn max_size(mut self, bytes: u64) -> DiskCache<G> {
        self.max_size = bytes;
        self
    }

    /// Returns the wrapped gateway.
    pub fn into_inner(self) -> G {
        self.inner
    }

    /// The slow-path fill: with the exclusive lock held, stream the
    /// whole block from the upstream into the cache file, then trim the
    /// file to the bytes actually written.
    fn fill(&self, file: &mut File, path: &Path, locator: &str) -> Result<()> {
        file.seek(SeekFrom::Start(0))
            .map_err(|e| io_context(path, "seek", e))?;
        let n = self.inner.block_read(locator, &mut &*file)?;
        file.set_len(n as u64)
            .map_err(|e| io_context(path, "truncate", e))?;
        Ok(())
    }

    /// The write pipeline's feeder: copies the caller's source into the
    /// staging file, the pipe to the upstream, and the hash check, then
    /// commits the staging file if everything lines up.  The feeder
    /// owns closing and unlinking the staging file and closing the pipe
    /// writer; the caller owns closing the pipe reader.
    fn feed(
        &self,
        mut src: Box<dyn Read + Send + '_>,
        mut staged: File,
        staged_path: &Path,
        mut pipe: os_pipe::PipeWriter,
        expected_size: Option<u64>,
        expected_hash: Option<String>,
        verdict: mpsc::SyncSender<Error>,
    ) {
        let mut hasher = Md5::new();
        let mut buf = [0u8; 64 * 1024];
        let mut written: u64 = 0;
        let copied: io::Result<()> = loop {
            let n = match src.read(&mut buf) {
                Ok(0) => break Ok(()),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => break Err(e),
            };
            if let Err(e) = staged.write_all(&buf[..n]) {
                break Err(e);
            }
            // A broken pipe here means the upstream stopped reading;
            // its error reaches the caller unless we hit one first.
            if let Err(e) = pipe.write_all(&buf[..n]) {
                break Err(e);
            }
            hasher.update(&buf[..n]);
            written += n as u64;
        };

        if let Err(e) = copied {
            let _ = verdict.try_send(e.into());
            let _ = std::fs::remove_file(staged_path);
            return;
        }
        if let Some(expected) = expected_size {
            if expected != written {
                let _ = verdict.try_send(Error::SizeMismatch {
                    expected,
                    actual: written,
                });
                let _ = std::fs::remove_file(staged_path);
                return;
            }
        }

        drop(staged);
        let actual = hex_digest(hasher);
        if let Some(expected) = expected_hash {
            if expected != actual {
                // Even if the upstream doesn't notice a problem, this
                // counts as an error, and the cache must not keep a
                // copy under a hash the contents don't match.
                let _ = verdict.try_send(Error::HashMismatch { expected, actual });
                let _ = std::fs::remove_file(staged_path);
                return;
            }
        }

        match layout::cache_file_path(&self.dir, &actual) {
            Ok(committed) => {
                if let Err(e) = rename_with_parent(staged_path, &committed) {
                    debug!(
                        staged = %staged_path.display(),
                        committed = %committed.display(),
                        error = %e,
                        "block_write: commit rename failed",
                    );
                }
            }
            Err(e) => {
                debug!(hash = %actual, error = %e, "block_write: unusable computed hash");
            }
        }
        let _ = std::fs::remove_file(staged_path);
        // The pipe writer drops last, so the upstream keeps draining
        // while the commit happens.
    }
}

impl<G: BlockGateway> BlockGateway for DiskCache<G> {
    /// Reads the requested range from the cache, filling the cache file
    /// from the upstream first if it is missing or too short.
    fn read_at(&self, locator: &str, dst: &mut [u8], offset: u64) -> Result<usize> {
        self.tidy.trigger(&self.dir, self.max_size);
        let path = layout::cache_file_path(&self.dir, locator)?;

        if let Ok(n) = self.heldopen.quick_read_at(&path, dst, offset) {
            return Ok(n);
        }

        let mut file = match open_or_create(&path, &rw_create_options()) {
            Ok(f) => f,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "read_at: open failed; bypassing cache");
                return self.inner.read_at(locator, dst, offset);
            }
        };

        flock::lock_shared(&file, &path)?;

        let window = offset + dst.len() as u64;
        let mut size = file
            .metadata()
            .map_err(|e| io_context(&path, "stat", e))?
            .len();
        if size < window {
            // The cache file seems truncated or empty (possibly
            // because we just created it).  Wait for an exclusive
            // lock, then check again in case another task was filling
            // it all along.
            flock::lock_exclusive(&file, &path)?;
            size = file
                .metadata()
                .map_err(|e| io_context(&path, "stat", e))?
                .len();
            if size < window {
                // Still short, and the exclusive lock is ours: fill it.
                self.fill(&mut file, &path, locator)?;
            }
        }

        Ok(read_full_at(&file, dst, offset).map_err(|e| io_context(&path, "read", e))?)
    }

    /// Streams the whole block into `sink`, filling the cache file from
    /// the upstream first if it isn't complete.
    fn block_read(&self, locator: &str, sink: &mut dyn Write) -> Result<usize> {
        self.tidy.trigger(&self.dir, self.max_size);
        let block_size = Locator::new(locator).size()?;
        let path = layout::cache_file_path(&self.dir, locator)?;

        let mut file = match open_or_create(&path, &rw_create_options()) {
            Ok(f) => f,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "block_read: open failed; bypassing cache");
                return self.inner.block_read(locator, sink);
            }
        };

        flock::lock_shared(&file, &path)?;
        let size = file
            .metadata()
            .map_err(|e| io_context(&path, "stat", e))?
            .len();
        if size == block_size {
            file.seek(SeekFrom::Start(0))
                .map_err(|e| io_context(&path, "seek", e))?;
            let n = io::copy(&mut file, sink).map_err(Error::Io)?;
            return Ok(n as usize);
        }

        // Incomplete: take the exclusive lock and refill.  No size
        // re-check after the upgrade: the sink needs the whole block
        // either way, and rewriting identical bytes is harmless.
        flock::lock_exclusive(&file, &path)?;
        file.seek(SeekFrom::Start(0))
            .map_err(|e| io_context(&path, "seek", e))?;
        let n = {
            let mut tee = TeeWriter {
                a: &file,
                b: sink,
            };
            self.inner.block_read(locator, &mut tee)?
        };
        file.set_len(n as u64)
            .map_err(|e| io_context(&path, "truncate", e))?;
        Ok(n)
    }

    /// Writes through to the upstream and, if possible, retains a copy
    /// of the block in the cache.
    fn block_write(&self, opts: WriteOptions<'_>) -> Result<WriteResponse> {
        self.tidy.trigger(&self.dir, self.max_size);

        let staged_path = layout::new_tmp_file_path(&self.dir);
        let mut staging_opts = rw_create_options();
        staging_opts.create_new(true);
        let staged = match open_or_create(&staged_path, &staging_opts) {
            Ok(f) => f,
            Err(e) => {
                debug!(path = %staged_path.display(), error = %e, "block_write: staging open failed; bypassing cache");
                return self.inner.block_write(opts);
            }
        };

        let (pipe_r, pipe_w) = match os_pipe::pipe() {
            Ok(p) => p,
            Err(e) => {
                debug!(error = %e, "block_write: pipe failed; bypassing cache");
                let _ = std::fs::remove_file(&staged_path);
                return self.inner.block_write(opts);
            }
        };
        let upstream_end = match pipe_r.try_clone() {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, "block_write: pipe clone failed; bypassing cache");
                let _ = std::fs::remove_file(&staged_path);
                return self.inner.block_write(opts);
            }
        };

        let WriteOptions {
            data,
            reader,
            data_size,
            hash,
            replicas,
            storage_classes,
        } = opts;
        let src: Box<dyn Read + Send + '_> = match (data, reader) {
            (Some(d), _) => Box::new(d),
            (None, Some(r)) => r,
            (None, None) => Box::new(io::empty()),
        };
        let forwarded_size = data_size.or(data.map(|d| d.len() as u64));
        let forwarded_hash = hash.clone();
        let (verdict_tx, verdict_rx) = mpsc::sync_channel::<Error>(1);

        let (resp, early_verdict) = std::thread::scope(move |s| {
            s.spawn(move || {
                self.feed(
                    src,
                    staged,
                    &staged_path,
                    pipe_w,
                    data_size,
                    hash,
                    verdict_tx,
                )
            });

            // Write through to the upstream from the pipe, instead of
            // the original source.
            let resp = self.inner.block_write(WriteOptions {
                data: None,
                reader: Some(Box::new(upstream_end)),
                data_size: forwarded_size,
                hash: forwarded_hash,
                replicas,
                storage_classes,
            });
            // If the feeder failed before the upstream finished, its
            // verdict is more helpful than the consequent broken-pipe
            // or short-read noise the upstream saw.  Check before
            // closing the read end: closing it is what unblocks a
            // feeder stuck writing to a pipe nobody drains, and *that*
            // failure is noise we must not report.
            let early_verdict = verdict_rx.try_recv().ok();
            drop(pipe_r);
            (resp, early_verdict)
        });

        match early_verdict {
            Some(e) => Err(e),
            None => resp,
        }
    }

    /// Pass-through; the cache keys on the original locator.
    fn local_locator(&self, locator: &str) -> Result<String> {
        self.inner.local_locator(locator)
    }
}

#[cfg(test)]
use std::collections::HashMap;
#[cfg(test)]
use std::sync::atomic::{AtomicUsize, Ordering};
#[cfg(test)]
use std::sync::Arc;

/// An in-memory upstream that counts how often the cache leans on it.
#[cfg(test)]
#[derive(Clone, Debug, Default)]
struct MemGateway {
    state: Arc<MemState>,
}

#[cfg(test)]
#[derive(Debug, Default)]
struct MemState {
    blocks: parking_lot::Mutex<HashMap<String, Vec<u8>>>,
    read_at_calls: AtomicUsize,
    block_read_calls: AtomicUsize,
    block_write_calls: AtomicUsize,
}

#[cfg(test)]
fn md5_hex(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    hex_digest(hasher)
}

#[cfg(test)]
impl MemGateway {
    fn new() -> MemGateway {
        MemGateway::default()
    }

    /// Stores a block upstream-side and returns its locator.
    fn insert(&self, data: &[u8]) -> String {
        let hash = md5_hex(data);
        self.state
            .blocks
            .lock()
            .insert(hash.clone(), data.to_vec());
        format!("{}+{}", hash, data.len())
    }

    fn lookup(&self, locator: &str) -> std::result::Result<Vec<u8>, Error> {
        let hash = Locator::new(locator).hash();
        self.state
            .blocks
            .lock()
            .get(hash)
            .cloned()
            .ok_or_else(|| {
                Error::Io(io::Error::new(io::ErrorKind::NotFound, "no such block"))
            })
    }

    fn block_read_calls(&self) -> usize {
        self.state.block_read_calls.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
impl BlockGateway for MemGateway {
    fn read_at(&self, locator: &str, dst: &mut [u8], offset: u64) -> Result<usize> {
        self.state.read_at_calls.fetch_add(1, Ordering::SeqCst);
        let data = self.lookup(locator)?;
        let start = (offset as usize).min(data.len());
        let end = (start + dst.len()).min(data.len());
        dst[..end - start].copy_from_slice(&data[start..end]);
        Ok(end - start)
    }

    fn block_read(&self, locator: &str, sink: &mut dyn Write) -> Result<usize> {
        self.state.block_read_calls.fetch_add(1, Ordering::SeqCst);
        let data = self.lookup(locator)?;
        sink.write_all(&data).map_err(Error::Io)?;
        Ok(data.len())
    }

    fn block_write(&self, opts: WriteOptions<'_>) -> Result<WriteResponse> {
        self.state.block_write_calls.fetch_add(1, Ordering::SeqCst);
        let data = match (opts.data, opts.reader) {
            (Some(d), _) => d.to_vec(),
            (None, Some(mut r)) => {
                let mut buf = Vec::new();
                r.read_to_end(&mut buf).map_err(Error::Io)?;
                buf
            }
            (None, None) => Vec::new(),
        };
        let locator = self.insert(&data);
        Ok(WriteResponse {
            locator,
            replicas: opts.replicas.unwrap_or(1),
        })
    }

    fn local_locator(&self, locator: &str) -> Result<String> {
        Ok(format!("local-{}", locator))
    }
}

/// A cold read fills from the upstream once; the second read is served
/// entirely from disk.
#[test]
fn test_miss_then_hit() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let upstream = MemGateway::new();
    let locator = upstream.insert(b"sixteen bytes!!!");
    let cache = DiskCache::new(upstream.clone(), temp.path("."));

    let mut dst = [0u8; 16];
    assert_eq!(
        cache
            .read_at(&locator, &mut dst, 0)
            .expect("read must succeed"),
        16
    );
    assert_eq!(&dst, b"sixteen bytes!!!");
    assert_eq!(upstream.block_read_calls(), 1);

    let mut dst = [0u8; 16];
    assert_eq!(
        cache
            .read_at(&locator, &mut dst, 0)
            .expect("read must succeed"),
        16
    );
    assert_eq!(&dst, b"sixteen bytes!!!");
    // Served from disk: no new upstream traffic.
    assert_eq!(upstream.block_read_calls(), 1);
}

/// Ranged reads return the right window of the block.
#[test]
fn test_ranged_read() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let upstream = MemGateway::new();
    let locator = upstream.insert(b"0123456789abcdef");
    let cache = DiskCache::new(upstream, temp.path("."));

    let mut dst = [0u8; 6];
    assert_eq!(
        cache
            .read_at(&locator, &mut dst, 4)
            .expect("read must succeed"),
        6
    );
    assert_eq!(&dst, b"456789");
}

/// A write passes through to the upstream and leaves a committed copy
/// behind, so the round-trip read never goes upstream.
#[test]
fn test_write_round_trip() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let upstream = MemGateway::new();
    let cache = DiskCache::new(upstream.clone(), temp.path("."));

    let data = b"some block contents";
    let resp = cache
        .block_write(WriteOptions::from_data(data))
        .expect("write must succeed");
    assert_eq!(resp.locator, format!("{}+{}", md5_hex(data), data.len()));
    assert_eq!(upstream.state.block_write_calls.load(Ordering::SeqCst), 1);

    // The committed file is in place and hashes to its name.
    let committed = layout::cache_file_path(&temp.path("."), &resp.locator)
        .expect("path must derive");
    let on_disk = std::fs::read(&committed).expect("committed file must exist");
    assert_eq!(&on_disk, data);

    let mut dst = vec![0u8; data.len()];
    cache
        .read_at(&resp.locator, &mut dst, 0)
        .expect("read must succeed");
    assert_eq!(&dst, data);
    assert_eq!(upstream.block_read_calls(), 0);
}

/// A streaming write (reader + size) commits just like a buffer write.
#[test]
fn test_write_from_reader() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let upstream = MemGateway::new();
    let cache = DiskCache::new(upstream, temp.path("."));

    let data = b"streamed contents";
    let resp = cache
        .block_write(WriteOptions::from_reader(&data[..], data.len() as u64))
        .expect("write must succeed");

    let committed = layout::cache_file_path(&temp.path("."), &resp.locator)
        .expect("path must derive");
    assert_eq!(
        std::fs::read(&committed).expect("committed file must exist"),
        data
    );
}

/// Counts the staging files left under `dir/tmp`.
#[cfg(test)]
fn staged_file_count(dir: &Path) -> usize {
    match std::fs::read_dir(dir.join(layout::TMP_SUBDIR)) {
        Ok(iter) => iter
            .flatten()
            .filter(|e| {
                e.file_name()
                    .to_string_lossy()
                    .ends_with(layout::TMP_FILE_SUFFIX)
            })
            .count(),
        Err(_) => 0,
    }
}

/// A write whose contents don't match the promised hash fails, commits
/// nothing, and leaves no staging debris.
#[test]
fn test_write_hash_mismatch() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let upstream = MemGateway::new();
    let cache = DiskCache::new(upstream, temp.path("."));

    let data = b"hello";
    let err = cache
        .block_write(WriteOptions::from_data(data).expect_hash("deadbeefdeadbeefdeadbeefdeadbeef"))
        .expect_err("mismatched hash must fail");
    assert!(matches!(err, Error::HashMismatch { .. }));

    let committed = layout::cache_file_path(&temp.path("."), &md5_hex(data))
        .expect("path must derive");
    assert!(std::fs::metadata(&committed).is_err());
    assert_eq!(staged_file_count(&temp.path(".")), 0);
}

/// A write whose source yields the wrong number of bytes fails with a
/// size mismatch and commits nothing.
#[test]
fn test_write_size_mismatch() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let upstream = MemGateway::new();
    let cache = DiskCache::new(upstream, temp.path("."));

    let data = b"four";
    let err = cache
        .block_write(WriteOptions {
            data: Some(&data[..]),
            data_size: Some(99),
            ..Default::default()
        })
        .expect_err("mismatched size must fail");
    assert!(matches!(
        err,
        Error::SizeMismatch {
            expected: 99,
            actual: 4,
        }
    ));
    assert_eq!(staged_file_count(&temp.path(".")), 0);
}

/// With an unusable cache directory, reads and writes degrade to plain
/// pass-through instead of erroring.
#[test]
fn test_fallback_unusable_dir() {
    use test_dir::{DirBuilder, FileType, TestDir};

    // The "directory" is a regular file: every open under it fails.
    let temp = TestDir::temp().create("notadir", FileType::ZeroFile(0));
    let upstream = MemGateway::new();
    let locator = upstream.insert(b"contents");
    let cache = DiskCache::new(upstream.clone(), temp.path("notadir"));

    let mut dst = [0u8; 8];
    assert_eq!(
        cache
            .read_at(&locator, &mut dst, 0)
            .expect("read must fall back"),
        8
    );
    assert_eq!(&dst, b"contents");
    assert_eq!(upstream.state.read_at_calls.load(Ordering::SeqCst), 1);

    let resp = cache
        .block_write(WriteOptions::from_data(b"other"))
        .expect("write must fall back");
    assert_eq!(upstream.state.block_write_calls.load(Ordering::SeqCst), 1);
    assert!(upstream.lookup(&resp.locator).is_ok());
}

/// Two tasks racing on the same uncached block: exactly one fills from
/// the upstream and both read identical bytes.
#[test]
fn test_concurrent_fill() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let upstream = MemGateway::new();
    let locator = upstream.insert(b"sixteen bytes!!!");
    let cache = DiskCache::new(upstream.clone(), temp.path("."));

    std::thread::scope(|s| {
        for _ in 0..2 {
            s.spawn(|| {
                let mut dst = [0u8; 16];
                assert_eq!(
                    cache
                        .read_at(&locator, &mut dst, 0)
                        .expect("read must succeed"),
                    16
                );
                assert_eq!(&dst, b"sixteen bytes!!!");
            });
        }
    });

    assert_eq!(upstream.block_read_calls(), 1);
    let committed = layout::cache_file_path(&temp.path("."), &locator)
        .expect("path must derive");
    assert_eq!(
        std::fs::metadata(&committed).expect("file must exist").len(),
        16
    );
}

/// block_read streams a cold block through the cache file and a warm
/// block straight from it.
#[test]
fn test_block_read() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let upstream = MemGateway::new();
    let locator = upstream.insert(b"whole block contents");
    let cache = DiskCache::new(upstream.clone(), temp.path("."));

    let mut sink = Vec::new();
    assert_eq!(
        cache
            .block_read(&locator, &mut sink)
            .expect("read must succeed"),
        20
    );
    assert_eq!(&sink, b"whole block contents");
    assert_eq!(upstream.block_read_calls(), 1);

    let mut sink = Vec::new();
    assert_eq!(
        cache
            .block_read(&locator, &mut sink)
            .expect("read must succeed"),
        20
    );
    assert_eq!(&sink, b"whole block contents");
    assert_eq!(upstream.block_read_calls(), 1);
}

/// A locator without a size hint can't be streamed; the upstream is
/// never consulted.
#[test]
fn test_block_read_invalid_locator() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let upstream = MemGateway::new();
    let cache = DiskCache::new(upstream.clone(), temp.path("."));

    let mut sink = Vec::new();
    let err = cache
        .block_read("acbd18db4cc2f85cedef654fccc4a4d8", &mut sink)
        .expect_err("missing size hint must fail");
    assert!(matches!(err, Error::InvalidLocator(_)));
    assert_eq!(upstream.block_read_calls(), 0);
}

/// local_locator is a pure pass-through.
#[test]
fn test_local_locator() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let cache = DiskCache::new(MemGateway::new(), temp.path("."));

    assert_eq!(
        cache.local_locator("abc+3").expect("must succeed"),
        "local-abc+3"
    );
}

/// Caches stack: a cache over a cache over the upstream still
/// round-trips, and the inner layers fill too.
#[test]
fn test_stacked_caches() {
    use test_dir::{DirBuilder, FileType, TestDir};

    let temp = TestDir::temp()
        .create("outer", FileType::Dir)
        .create("inner", FileType::Dir);
    let upstream = MemGateway::new();
    let locator = upstream.insert(b"stacked contents");
    let stack = DiskCache::new(
        DiskCache::new(upstream.clone(), temp.path("inner")),
        temp.path("outer"),
    );

    let mut dst = [0u8; 16];
    assert_eq!(
        stack
            .read_at(&locator, &mut dst, 0)
            .expect("read must succeed"),
        16
    );
    assert_eq!(&dst, b"stacked contents");
    assert_eq!(upstream.block_read_calls(), 1);

    for dir in ["outer", "inner"] {
        let committed = layout::cache_file_path(&temp.path(dir), &locator)
            .expect("path must derive");
        assert!(std::fs::metadata(&committed).is_ok(), "{} must be filled", dir);
    }
}

//! On-disk layout of a cache directory.  Committed blocks live at
//! `D/<xxx>/<hash>.cacheblock`, where `<xxx>` is the first three hex
//! characters of the hash (256-way fan-out keeps individual directories
//! small).  In-flight writes stage under `D/tmp/`, which also hosts the
//! tidy lock file.  The suffixes and the fan-out width are part of the
//! interface: every process sharing a cache directory must use identical
//! values.
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};
use crate::locator::Locator;

/// Committed cache files end with this suffix.
pub const CACHE_FILE_SUFFIX: &str = ".cacheblock";

/// In-flight staging files end with this suffix.
pub const TMP_FILE_SUFFIX: &str = ".tmp";

/// Staging files and the tidy lock live in this subdirectory.
pub const TMP_SUBDIR: &str = "tmp";

/// Fan-out width: number of leading hash characters in the bucket name.
const FANOUT_WIDTH: usize = 3;

// Staging names must never collide, neither between threads in this
// process nor between sibling processes sharing the directory; the name
// combines the pid with this process-wide counter.
static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Returns the committed path for `locator` under `dir`.
///
/// # Errors
///
/// Fails with [`Error::InvalidLocator`] if the hash is too short to name
/// a fan-out bucket.
pub fn cache_file_path(dir: &Path, locator: &str) -> Result<PathBuf> {
    let hash = Locator::new(locator).hash();
    if hash.len() < FANOUT_WIDTH || !hash.is_char_boundary(FANOUT_WIDTH) {
        return Err(Error::InvalidLocator("hash too short"));
    }

    let mut path = dir.to_owned();
    path.push(&hash[..FANOUT_WIDTH]);
    let mut name = String::with_capacity(hash.len() + CACHE_FILE_SUFFIX.len());
    name.push_str(hash);
    name.push_str(CACHE_FILE_SUFFIX);
    path.push(name);
    Ok(path)
}

/// Returns a staging path under `dir/tmp/` that is unique across
/// concurrent writers in this process and across sibling processes.
pub fn new_tmp_file_path(dir: &Path) -> PathBuf {
    let unique = format!(
        "{:x}.{:x}{}",
        std::process::id(),
        TMP_COUNTER.fetch_add(1, Ordering::Relaxed),
        TMP_FILE_SUFFIX
    );

    let mut path = dir.to_owned();
    path.push(TMP_SUBDIR);
    path.push(unique);
    path
}

/// Returns the path of the inter-process tidy lock file.
pub fn tidy_lock_path(dir: &Path) -> PathBuf {
    let mut path = dir.to_owned();
    path.push(TMP_SUBDIR);
    path.push("tidy.lock");
    path
}

/// The committed path buckets by the first three hash characters and
/// drops the locator's hints.
#[test]
fn test_cache_file_path() {
    let dir = Path::new("/stash");

    let path = cache_file_path(dir, "acbd18db4cc2f85cedef654fccc4a4d8+3+Af00d@1234")
        .expect("path must derive");
    assert_eq!(
        path,
        Path::new("/stash/acb/acbd18db4cc2f85cedef654fccc4a4d8.cacheblock")
    );

    // A bare hash works too: the size hint only matters for reads.
    let path = cache_file_path(dir, "acbd18db4cc2f85cedef654fccc4a4d8").expect("path must derive");
    assert_eq!(
        path,
        Path::new("/stash/acb/acbd18db4cc2f85cedef654fccc4a4d8.cacheblock")
    );
}

/// Hashes too short for the fan-out are rejected, not sliced.
#[test]
fn test_short_hash() {
    assert!(matches!(
        cache_file_path(Path::new("/stash"), "ab+3"),
        Err(Error::InvalidLocator(_))
    ));
}

/// Staging names are distinct even for back-to-back calls.
#[test]
fn test_tmp_file_path() {
    let dir = Path::new("/stash");

    let first = new_tmp_file_path(dir);
    let second = new_tmp_file_path(dir);

    assert_ne!(first, second);
    assert!(first.starts_with("/stash/tmp"));
    assert!(first
        .to_str()
        .expect("path is ascii")
        .ends_with(TMP_FILE_SUFFIX));
}

/// The tidy lock lives next to the staging files.
#[test]
fn test_tidy_lock_path() {
    assert_eq!(
        tidy_lock_path(Path::new("/stash")),
        Path::new("/stash/tmp/tidy.lock")
    );
}

//! Advisory whole-file locks.  POSIX `flock` is the only inter-process
//! coordination the cache uses: shared while reading a block file,
//! exclusive while filling it, and non-blocking exclusive for the tidy
//! pass.  Locks attach to the open file description, so two threads
//! with separately opened handles exclude each other just like two
//! processes do, and every lock releases when its `File` drops.
use std::fs::File;
use std::io;
use std::path::Path;

use fs2::FileExt;

/// Adds the locked path and operation to a lock error.  Lock failures
/// are unexpected (callers do not fall back on them), so the diagnostic
/// has to carry enough context on its own.
fn annotate(err: io::Error, path: &Path, op: &str) -> io::Error {
    io::Error::new(
        err.kind(),
        format!("flock({}, {}) failed: {}", path.display(), op, err),
    )
}

/// Blocks until a shared lock on `file` is granted.
pub fn lock_shared(file: &File, path: &Path) -> io::Result<()> {
    file.lock_shared().map_err(|e| annotate(e, path, "lock_sh"))
}

/// Blocks until an exclusive lock on `file` is granted, upgrading a
/// shared lock held on the same handle.  The upgrade is not atomic:
/// another task may slip in between, so callers must re-check whatever
/// condition sent them here.
pub fn lock_exclusive(file: &File, path: &Path) -> io::Result<()> {
    file.lock_exclusive()
        .map_err(|e| annotate(e, path, "lock_ex"))
}

/// Attempts an exclusive lock without blocking.  Returns `Ok(false)` if
/// another handle holds the lock.
pub fn try_lock_exclusive(file: &File, path: &Path) -> io::Result<bool> {
    match file.try_lock_exclusive() {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
        // fs2 reports contention as its own error value on some
        // platforms; treat any EWOULDBLOCK errno the same way.
        Err(e) if e.raw_os_error() == Some(libc::EWOULDBLOCK) => Ok(false),
        Err(e) => Err(annotate(e, path, "lock_ex|lock_nb")),
    }
}

/// Two handles can share the lock; a third can't take it exclusively.
#[test]
fn test_shared_then_exclusive() {
    use test_dir::{DirBuilder, FileType, TestDir};

    let temp = TestDir::temp().create("lockfile", FileType::ZeroFile(0));
    let path = temp.path("lockfile");

    let a = File::open(&path).expect("open must succeed");
    let b = File::open(&path).expect("open must succeed");
    lock_shared(&a, &path).expect("first shared lock must succeed");
    lock_shared(&b, &path).expect("second shared lock must succeed");

    let c = File::open(&path).expect("open must succeed");
    assert!(!try_lock_exclusive(&c, &path).expect("try must not error"));

    // Dropping the readers frees the lock.
    drop(a);
    drop(b);
    assert!(try_lock_exclusive(&c, &path).expect("try must not error"));
}

/// An exclusive holder blocks other exclusive attempts until dropped.
#[test]
fn test_exclusive_exclusion() {
    use test_dir::{DirBuilder, FileType, TestDir};

    let temp = TestDir::temp().create("lockfile", FileType::ZeroFile(0));
    let path = temp.path("lockfile");

    let holder = File::open(&path).expect("open must succeed");
    lock_exclusive(&holder, &path).expect("exclusive lock must succeed");

    let other = File::open(&path).expect("open must succeed");
    assert!(!try_lock_exclusive(&other, &path).expect("try must not error"));

    drop(holder);
    assert!(try_lock_exclusive(&other, &path).expect("try must not error"));
}

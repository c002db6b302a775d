//! Small filesystem helpers shared by the data plane: opening cache
//! files with lazy parent-directory creation, publishing staged files by
//! rename, and positional reads that either fill the caller's buffer or
//! fail.  The cache leans on the filesystem for concurrency control, so
//! these helpers stay deliberately thin over the syscalls.
use std::fs::{DirBuilder, File, OpenOptions};
use std::io;
use std::io::ErrorKind;
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;

/// Checks whether the error is for a missing file: NotFound, or a stale
/// NFS handle.  A stale handle means the inode isn't available on the
/// server anymore; things do go missing from caches, so both cases get
/// the same create-the-parent-and-retry treatment.
pub fn is_absent_file_error(error: &io::Error) -> bool {
    if error.kind() == ErrorKind::NotFound {
        true
    } else if let Some(errno) = error.raw_os_error() {
        // ErrorKind::StaleNetworkFileHandle is not stabilised yet.
        errno == libc::ESTALE
    } else {
        false
    }
}

/// Creates `path`'s immediate parent directory, mode `0700`.  Errors
/// (including already-exists) are ignored; if the parent is genuinely
/// unusable, the caller's retry will surface the real failure.
fn create_parent(path: &Path) {
    if let Some(parent) = path.parent() {
        let _ = DirBuilder::new().mode(0o700).create(parent);
    }
}

/// Opens `path` with `opts`.  On a missing-file error, creates the
/// single parent directory and retries exactly once.  (We could check
/// for the parent up front, but that would cost a stat in the much more
/// common case where it already exists.)
///
/// `opts` should carry mode `0600` for paths this call may create.
pub fn open_or_create(path: &Path, opts: &OpenOptions) -> io::Result<File> {
    match opts.open(path) {
        Err(e) if is_absent_file_error(&e) => {
            create_parent(path);
            opts.open(path)
        }
        res => res,
    }
}

/// Renames `src` to `dst`; on failure, creates `dst`'s parent directory
/// and retries exactly once.
pub fn rename_with_parent(src: &Path, dst: &Path) -> io::Result<()> {
    if std::fs::rename(src, dst).is_ok() {
        return Ok(());
    }

    create_parent(dst);
    std::fs::rename(src, dst)
}

/// Reads exactly `dst.len()` bytes from `file` at `offset`.
///
/// Returns `UnexpectedEof` if the file ends first: a short cache file is
/// one that is still being filled (or was never filled), and callers
/// must treat it as a miss rather than serve truncated data.
pub fn read_full_at(file: &File, dst: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;

    let mut filled = 0;
    while filled < dst.len() {
        match file.read_at(&mut dst[filled..], offset + filled as u64) {
            Ok(0) => {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "cache file shorter than read window",
                ))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(filled)
}

/// Returns `OpenOptions` for read-write-create access with the cache's
/// file mode.
pub fn rw_create_options() -> OpenOptions {
    use std::os::unix::fs::OpenOptionsExt;

    let mut opts = OpenOptions::new();
    opts.read(true).write(true).create(true).mode(0o600);
    opts
}

/// Mostly trivial, but let's make sure raw_os_error plumbing agrees with
/// libc on the platforms we care about.
#[test]
fn test_absent_file_error() {
    assert!(is_absent_file_error(&io::Error::new(
        ErrorKind::NotFound,
        "not found"
    )));
    assert!(!is_absent_file_error(&io::Error::new(
        ErrorKind::PermissionDenied,
        "bad"
    )));
    assert!(is_absent_file_error(&io::Error::from_raw_os_error(
        libc::ENOENT
    )));
    assert!(is_absent_file_error(&io::Error::from_raw_os_error(
        libc::ESTALE
    )));
    assert!(!is_absent_file_error(&io::Error::from_raw_os_error(
        libc::EIO
    )));
}

/// Opening a path whose parent is missing creates that one parent.
#[test]
fn test_open_or_create_makes_parent() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let path = temp.path("bucket").join("block");

    let file = open_or_create(&path, &rw_create_options()).expect("open must succeed");
    drop(file);

    assert!(std::fs::metadata(&path).is_ok());
}

/// Only a single level of parent is created; a deeper missing chain is
/// an error.
#[test]
fn test_open_or_create_single_level() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let path = temp.path("a").join("b").join("block");

    assert!(open_or_create(&path, &rw_create_options()).is_err());
}

/// Renaming into a missing directory creates it and retries.
#[test]
fn test_rename_with_parent() {
    use test_dir::{DirBuilder, FileType, TestDir};

    let temp = TestDir::temp().create("staged", FileType::ZeroFile(10));
    let src = temp.path("staged");
    let dst = temp.path("bucket").join("block");

    rename_with_parent(&src, &dst).expect("rename must succeed");

    assert!(matches!(std::fs::metadata(&src),
                     Err(e) if e.kind() == ErrorKind::NotFound));
    assert_eq!(
        std::fs::metadata(&dst).expect("dst must exist").len(),
        10
    );
}

/// A full-window read returns the window; a short file reports
/// UnexpectedEof instead of truncated bytes.
#[test]
fn test_read_full_at() {
    use std::io::Write;
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let path = temp.path("block");
    {
        let mut f = File::create(&path).expect("create must succeed");
        f.write_all(b"0123456789").expect("write must succeed");
    }

    let f = File::open(&path).expect("open must succeed");

    let mut dst = [0u8; 4];
    assert_eq!(
        read_full_at(&f, &mut dst, 3).expect("in-range read must succeed"),
        4
    );
    assert_eq!(&dst, b"3456");

    let mut dst = [0u8; 8];
    assert!(matches!(read_full_at(&f, &mut dst, 5),
                     Err(e) if e.kind() == ErrorKind::UnexpectedEof));
}

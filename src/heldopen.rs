//! The heldopen pool keeps read-only handles to committed cache files
//! open across reads, so the common hit path costs one positional read
//! instead of an open/flock/read/close cycle.  The pool is an in-process
//! cache of `File`s keyed by path, guarded by one short-held mutex; each
//! entry carries its own read-write lock so initialization and teardown
//! never block unrelated readers.
//!
//! Eviction is deliberately crude: when the map outgrows its cap, we
//! detach the whole map and close every handle in the background.
//! Tracking per-entry access times would cost more than it saves;
//! even the pathological worst case is one extra open+close per read.
use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::flock;
use crate::fsutil::read_full_at;

/// A pooled read-only handle.  `err` records an initialization failure;
/// when it is set the handle must not be used.  `file == None` with no
/// error means a pool sweep closed the handle.
#[derive(Debug, Default)]
struct EntState {
    file: Option<File>,
    err: Option<Arc<io::Error>>,
}

#[derive(Debug, Default)]
pub(crate) struct OpenFileEnt {
    state: RwLock<EntState>,
}

#[derive(Debug, Default)]
struct PoolMap {
    map: HashMap<PathBuf, Arc<OpenFileEnt>>,
    // Lazily computed from RLIMIT_NOFILE; zero means "not yet".
    cap: usize,
}

#[derive(Debug, Default)]
pub(crate) struct HeldopenPool {
    inner: Arc<Mutex<PoolMap>>,
}

/// Picks a reasonable limit on pooled open files from the process's
/// RLIMIT_NOFILE soft limit, leaving plenty of headroom for everything
/// else the process wants descriptors for.
fn default_cap() -> usize {
    let mut lim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // getrlimit only writes the out-param.
    let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut lim) };
    if rc != 0 {
        256
    } else if lim.rlim_cur > 40_000 {
        10_000
    } else {
        (lim.rlim_cur / 4) as usize
    }
}

/// Closes every handle in a detached pool map, taking each entry's
/// exclusive lock so in-flight reads finish first.
fn sweep(stale: HashMap<PathBuf, Arc<OpenFileEnt>>) {
    for ent in stale.into_values() {
        let mut st = ent.state.write();
        st.file = None;
    }
}

impl HeldopenPool {
    pub fn new() -> HeldopenPool {
        HeldopenPool::default()
    }

    /// Removes `ent` from the pool in the background, so the next read
    /// of `path` reopens the file.  The removal re-checks that the map
    /// still holds this exact entry: a sweep plus a fresh insert may
    /// have replaced it, and the replacement must survive.
    fn forget(&self, path: &Path, ent: &Arc<OpenFileEnt>) {
        let inner = Arc::clone(&self.inner);
        let path = path.to_owned();
        let ent = Arc::clone(ent);
        std::thread::spawn(move || {
            let mut pool = inner.lock();
            if let Some(current) = pool.map.get(&path) {
                if Arc::ptr_eq(current, &ent) {
                    pool.map.remove(&path);
                }
            }
        });
    }

    /// Attempts to read `dst.len()` bytes at `offset` from the pooled
    /// handle for `path`, opening and pooling one on first use.
    ///
    /// This is only a fast path: on *any* error the failing entry is
    /// scheduled for removal and the error propagates, and the caller
    /// is expected to retry through the slow path.  In particular,
    /// concurrent callers can fail spuriously when one of them hits an
    /// error or a sweep closes the shared handle.
    pub fn quick_read_at(&self, path: &Path, dst: &mut [u8], offset: u64) -> io::Result<usize> {
        let ent: Arc<OpenFileEnt>;

        let mut pool = self.inner.lock();
        if pool.cap == 0 {
            pool.cap = default_cap();
        }
        match pool.map.get(path).cloned() {
            Some(existing) => {
                drop(pool);
                ent = existing;
            }
            None => {
                if pool.map.len() > pool.cap {
                    let stale = std::mem::take(&mut pool.map);
                    std::thread::spawn(move || sweep(stale));
                }
                ent = Arc::new(OpenFileEnt::default());
                pool.map.insert(path.to_owned(), Arc::clone(&ent));

                // Publish the entry already write-locked: concurrent
                // readers of the same path will queue on the entry, not
                // on the pool mutex, until initialization finishes.
                let mut st = ent.state.write();
                drop(pool);

                match File::open(path).and_then(|f| {
                    flock::lock_shared(&f, path)?;
                    Ok(f)
                }) {
                    Ok(f) => st.file = Some(f),
                    Err(e) => {
                        st.err = Some(Arc::new(e));
                        self.forget(path, &ent);
                    }
                }
            }
        }

        // The shared lock both waits out a concurrent initializer and
        // keeps a concurrent sweep from closing the handle mid-read.
        let st = ent.state.read();
        if let Some(err) = &st.err {
            return Err(io::Error::new(err.kind(), Arc::clone(err)));
        }
        let file = match &st.file {
            Some(f) => f,
            None => {
                return Err(io::Error::new(
                    ErrorKind::Other,
                    "quick read lost race with a pool sweep",
                ))
            }
        };

        let ret = read_full_at(file, dst, offset);
        if ret.is_err() {
            // Reopening the backing file may help; let the next reader
            // find out.
            self.forget(path, &ent);
        }
        ret
    }

    #[cfg(test)]
    fn set_cap(&self, cap: usize) {
        self.inner.lock().cap = cap;
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().map.len()
    }
}

/// Waits for the background removal threads spawned by `forget`.
#[cfg(test)]
fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
    panic!("condition not reached in time");
}

/// First read opens and pools the handle; repeat reads reuse it.
#[test]
fn test_quick_read() {
    use std::io::Write;
    use tempfile::TempDir;

    let temp = TempDir::new().expect("tempdir must create");
    let path = temp.path().join("block");
    {
        let mut f = File::create(&path).expect("create must succeed");
        f.write_all(b"0123456789").expect("write must succeed");
    }

    let pool = HeldopenPool::new();

    let mut dst = [0u8; 4];
    assert_eq!(
        pool.quick_read_at(&path, &mut dst, 2)
            .expect("read must succeed"),
        4
    );
    assert_eq!(&dst, b"2345");
    assert_eq!(pool.len(), 1);

    // Second read hits the pooled handle.
    let mut dst = [0u8; 10];
    assert_eq!(
        pool.quick_read_at(&path, &mut dst, 0)
            .expect("read must succeed"),
        10
    );
    assert_eq!(&dst, b"0123456789");
    assert_eq!(pool.len(), 1);
}

/// A missing file fails the read and the poisoned entry is removed, so
/// a later read can succeed once the file exists.
#[test]
fn test_quick_read_missing_file() {
    use std::io::Write;
    use tempfile::TempDir;

    let temp = TempDir::new().expect("tempdir must create");
    let path = temp.path().join("block");

    let pool = HeldopenPool::new();

    let mut dst = [0u8; 4];
    assert!(matches!(pool.quick_read_at(&path, &mut dst, 0),
                     Err(e) if e.kind() == ErrorKind::NotFound));

    wait_until(|| pool.len() == 0);

    {
        let mut f = File::create(&path).expect("create must succeed");
        f.write_all(b"data").expect("write must succeed");
    }
    assert_eq!(
        pool.quick_read_at(&path, &mut dst, 0)
            .expect("read must succeed"),
        4
    );
    assert_eq!(&dst, b"data");
}

/// A short file reports UnexpectedEof (the slow path treats that as a
/// miss) and the entry is dropped for a fresh look next time.
#[test]
fn test_quick_read_short_file() {
    use std::io::Write;
    use tempfile::TempDir;

    let temp = TempDir::new().expect("tempdir must create");
    let path = temp.path().join("block");
    {
        let mut f = File::create(&path).expect("create must succeed");
        f.write_all(b"ab").expect("write must succeed");
    }

    let pool = HeldopenPool::new();

    let mut dst = [0u8; 8];
    assert!(matches!(pool.quick_read_at(&path, &mut dst, 0),
                     Err(e) if e.kind() == ErrorKind::UnexpectedEof));

    wait_until(|| pool.len() == 0);
}

/// Overflowing the cap detaches the whole map; reads keep working
/// against fresh entries.
#[test]
fn test_sweep_on_overflow() {
    use std::io::Write;
    use tempfile::TempDir;

    let temp = TempDir::new().expect("tempdir must create");
    let mut paths = Vec::new();
    for i in 0..6 {
        let path = temp.path().join(format!("block{}", i));
        let mut f = File::create(&path).expect("create must succeed");
        f.write_all(b"contents").expect("write must succeed");
        paths.push(path);
    }

    let pool = HeldopenPool::new();
    pool.set_cap(2);

    let mut dst = [0u8; 8];
    for path in &paths {
        assert_eq!(
            pool.quick_read_at(path, &mut dst, 0)
                .expect("read must succeed"),
            8
        );
        assert_eq!(&dst, b"contents");
        // The map is detached whenever an insert would leave it over
        // cap, so it never grows past cap + 1.
        assert!(pool.len() <= 3);
    }

    // Swept paths read fine again through a reopened handle.
    assert_eq!(
        pool.quick_read_at(&paths[0], &mut dst, 0)
            .expect("read must succeed"),
        8
    );
}

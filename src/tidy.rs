//! Background eviction ("tidy").  A pass walks the cache directory,
//! sums the committed and staging files it finds, and deletes the
//! least-recently-accessed ones until the total fits the size budget.
//! Access time is the LRU proxy, so the policy is only as good as the
//! filesystem's atime updates (relatime is fine; noatime degrades to
//! oldest-written-first).
//!
//! One process at a time: a non-blocking exclusive flock on
//! `D/tmp/tidy.lock` lets whichever sibling gets there first do the
//! work while everyone else returns immediately.  One pass at a time
//! within the process, with a hold-off after each pass: every
//! data-plane call triggers the scheduler, so both checks have to stay
//! lock-free on the common path.
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use filetime::FileTime;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::flock;
use crate::fsutil::open_or_create;
use crate::layout::{self, CACHE_FILE_SUFFIX, TMP_FILE_SUFFIX};

/// Once a pass finishes, further triggers are dropped for this long.
#[cfg(not(test))]
const TIDY_HOLD_DURATION: Duration = Duration::from_secs(10);

// We want eager re-triggering in tests.
#[cfg(test)]
const TIDY_HOLD_DURATION: Duration = Duration::from_millis(100);

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Default)]
struct SchedState {
    // Number of triggers currently "inside" the scheduler; the trigger
    // that takes this from 0 to 1 owns the pass.
    tidying: AtomicI32,
    // Triggers before this instant (millis since epoch) are dropped.
    hold_until: AtomicU64,
    // Computed budget for MaxSize == 0, cached across passes.
    default_max_size: AtomicU64,
}

/// Debounced single-flight launcher for tidy passes.
#[derive(Debug, Default)]
pub(crate) struct Scheduler {
    state: Arc<SchedState>,
}

impl Scheduler {
    pub fn new() -> Scheduler {
        Scheduler::default()
    }

    /// Starts a tidy pass on a background thread, unless one is already
    /// running in this process or one finished within the hold-off
    /// interval.
    pub fn trigger(&self, dir: &Path, max_size: u64) {
        let n = self.state.tidying.fetch_add(1, Ordering::SeqCst) + 1;
        if n != 1 || now_millis() < self.state.hold_until.load(Ordering::SeqCst) {
            self.state.tidying.fetch_sub(1, Ordering::SeqCst);
            return;
        }

        let state = Arc::clone(&self.state);
        let dir = dir.to_owned();
        std::thread::spawn(move || {
            tidy(&dir, max_size, &state.default_max_size);
            // The hold-off starts when the pass ends, not when it
            // starts; a slow walk shouldn't eat into the quiet period.
            state.hold_until.store(
                now_millis() + TIDY_HOLD_DURATION.as_millis() as u64,
                Ordering::SeqCst,
            );
            state.tidying.fetch_sub(1, Ordering::SeqCst);
        });
    }
}

struct TidyEnt {
    path: PathBuf,
    atime: FileTime,
    size: u64,
}

/// Deletes cache files as needed to keep disk usage under the budget.
///
/// With `configured_max == 0` the budget defaults to a tenth of the
/// filesystem's free space, computed once and cached in `default_max`;
/// if even that query fails, the first pass settles on
/// `max(scanned total, 1 GiB)` and deletes nothing.
pub(crate) fn tidy(dir: &Path, configured_max: u64, default_max: &AtomicU64) {
    let mut maxsize = configured_max;
    if maxsize == 0 {
        maxsize = default_max.load(Ordering::SeqCst);
        if maxsize == 0 {
            if let Ok(avail) = fs2::available_space(dir) {
                maxsize = avail / 10;
            }
            default_max.store(maxsize, Ordering::SeqCst);
        }
    }

    // Bail if a tidy pass is running in a sibling process.
    let lock_path = layout::tidy_lock_path(dir);
    let mut opts = std::fs::OpenOptions::new();
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.write(true).create(true).mode(0o600);
    }
    let lockfile = match open_or_create(&lock_path, &opts) {
        Ok(f) => f,
        Err(_) => return,
    };
    match flock::try_lock_exclusive(&lockfile, &lock_path) {
        Ok(true) => {}
        _ => return,
    }

    let mut ents = Vec::new();
    let mut total: u64 = 0;
    for entry in WalkDir::new(dir) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                debug!(error = %e, "tidy: skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if !name.ends_with(CACHE_FILE_SUFFIX) && !name.ends_with(TMP_FILE_SUFFIX) {
            continue;
        }
        let meta = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                debug!(error = %e, "tidy: skipping unstattable entry");
                continue;
            }
        };
        total += meta.len();
        ents.push(TidyEnt {
            atime: FileTime::from_last_access_time(&meta),
            size: meta.len(),
            path: entry.into_path(),
        });
    }
    debug!(total, maxsize, "tidy: checked current cache usage");

    // If MaxSize wasn't configured and the free-space query failed
    // above, settle on the larger of {current usage, 1 GiB} for
    // subsequent passes.
    if maxsize == 0 {
        let fallback = total.max(1 << 30);
        default_max.store(fallback, Ordering::SeqCst);
        debug!(total, default = fallback, "tidy: set default cache size");
        return;
    }

    if total <= maxsize {
        return;
    }

    // Delete oldest entries until we fit the budget.  Count a failed
    // delete as freed anyway: either the file is already gone, or it
    // will still be here for the next pass to retry.
    ents.sort_by_key(|e| e.atime);
    let mut deleted = 0;
    for ent in &ents {
        if let Err(e) = std::fs::remove_file(&ent.path) {
            warn!(path = %ent.path.display(), error = %e, "tidy: delete failed");
        }
        deleted += 1;
        total = total.saturating_sub(ent.size);
        if total <= maxsize {
            break;
        }
    }
    debug!(deleted, total, "tidy: remaining cache usage after deleting");
}

/// Creates a committed-looking cache file of `size` bytes with the
/// given access time.
#[cfg(test)]
fn plant_block(dir: &Path, name: &str, size: usize, atime_secs: i64) -> PathBuf {
    use std::io::Write;

    let bucket = dir.join(&name[..3]);
    std::fs::create_dir_all(&bucket).expect("bucket must create");
    let path = bucket.join(format!("{}{}", name, CACHE_FILE_SUFFIX));
    let mut f = std::fs::File::create(&path).expect("create must succeed");
    f.write_all(&vec![0u8; size]).expect("write must succeed");
    drop(f);
    filetime::set_file_atime(&path, FileTime::from_unix_time(atime_secs, 0))
        .expect("atime must set");
    path
}

/// Over budget by one block: exactly the oldest-accessed block goes.
#[test]
fn test_trim_oldest() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let dir = temp.path(".");

    let old = plant_block(&dir, "aaa111", 512, 1_000);
    let mid = plant_block(&dir, "bbb222", 512, 2_000);
    let new = plant_block(&dir, "ccc333", 512, 3_000);

    tidy(&dir, 1024, &AtomicU64::new(0));

    assert!(std::fs::metadata(&old).is_err());
    assert!(std::fs::metadata(&mid).is_ok());
    assert!(std::fs::metadata(&new).is_ok());
}

/// Under budget: nothing is deleted.
#[test]
fn test_under_budget() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let dir = temp.path(".");

    let a = plant_block(&dir, "aaa111", 512, 1_000);
    let b = plant_block(&dir, "bbb222", 512, 2_000);

    tidy(&dir, 4096, &AtomicU64::new(0));

    assert!(std::fs::metadata(&a).is_ok());
    assert!(std::fs::metadata(&b).is_ok());
}

/// Staging files count against the budget and are eligible for
/// deletion, like any other cache debris.
#[test]
fn test_trim_staging_files() {
    use std::io::Write;
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let dir = temp.path(".");

    let tmp_path = layout::new_tmp_file_path(&dir);
    std::fs::create_dir_all(tmp_path.parent().expect("tmp dir parent")).expect("mkdir");
    let mut f = std::fs::File::create(&tmp_path).expect("create must succeed");
    f.write_all(&[0u8; 512]).expect("write must succeed");
    drop(f);
    filetime::set_file_atime(&tmp_path, FileTime::from_unix_time(1_000, 0)).expect("atime");

    let block = plant_block(&dir, "aaa111", 512, 2_000);

    tidy(&dir, 512, &AtomicU64::new(0));

    assert!(std::fs::metadata(&tmp_path).is_err());
    assert!(std::fs::metadata(&block).is_ok());
}

/// While a sibling process holds the tidy lock, a pass is a no-op.
#[test]
fn test_locked_out() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let dir = temp.path(".");

    let block = plant_block(&dir, "aaa111", 512, 1_000);

    let lock_path = layout::tidy_lock_path(&dir);
    let mut opts = std::fs::OpenOptions::new();
    opts.write(true).create(true);
    let holder = open_or_create(&lock_path, &opts).expect("lock file must open");
    assert!(flock::try_lock_exclusive(&holder, &lock_path).expect("lock must succeed"));

    tidy(&dir, 1, &AtomicU64::new(0));
    assert!(std::fs::metadata(&block).is_ok());

    // Once the other process lets go, the next pass trims.
    drop(holder);
    tidy(&dir, 1, &AtomicU64::new(0));
    assert!(std::fs::metadata(&block).is_err());
}

/// With no configured budget, the first pass settles on a dynamic
/// default instead of deleting anything.
#[test]
fn test_dynamic_default() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let dir = temp.path(".");

    let block = plant_block(&dir, "aaa111", 512, 1_000);

    let default_max = AtomicU64::new(0);
    tidy(&dir, 0, &default_max);

    assert!(std::fs::metadata(&block).is_ok());
    assert!(default_max.load(Ordering::SeqCst) > 0);
}

/// The scheduler runs one pass, then drops triggers for the hold-off.
#[test]
fn test_scheduler_debounce() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let dir = temp.path(".");
    let sched = Scheduler::new();

    let block = plant_block(&dir, "aaa111", 512, 1_000);
    sched.trigger(&dir, 1);
    for _ in 0..200 {
        if std::fs::metadata(&block).is_err() {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(std::fs::metadata(&block).is_err());

    // Replanted within the hold-off: the trigger is dropped.
    let block = plant_block(&dir, "aaa111", 512, 1_000);
    sched.trigger(&dir, 1);
    std::thread::sleep(Duration::from_millis(50));
    assert!(std::fs::metadata(&block).is_ok());

    // After the hold-off expires, triggering works again.
    std::thread::sleep(TIDY_HOLD_DURATION);
    sched.trigger(&dir, 1);
    for _ in 0..200 {
        if std::fs::metadata(&block).is_err() {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(std::fs::metadata(&block).is_err());
}

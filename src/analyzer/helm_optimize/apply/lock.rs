//! Per-chart apply locks.
//!
//! One process-wide table maps canonical chart directories to a mutex.
//! Entries are created on first use and live for the rest of the process.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;

use super::paths::canonical_chart_path;

type LockTable = HashMap<PathBuf, Arc<Mutex<()>>>;

static CHART_LOCKS: LazyLock<Mutex<LockTable>> = LazyLock::new(|| Mutex::new(HashMap::new()));

/// The mutex serializing applies against `chart_dir`.
pub fn chart_lock(chart_dir: &Path) -> Arc<Mutex<()>> {
    let key = canonical_chart_path(chart_dir);
    let mut table = CHART_LOCKS.lock();
    Arc::clone(table.entry(key).or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_same_chart_same_lock() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("chart")).unwrap();
        let a = chart_lock(&dir.path().join("chart"));
        let b = chart_lock(&dir.path().join("chart/../chart/."));
        let other = chart_lock(dir.path());
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &other));
    }

    #[test]
    fn test_lock_serializes_holders() {
        let dir = TempDir::new().unwrap();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let path = dir.path().to_path_buf();
                let inside = Arc::clone(&inside);
                let max_inside = Arc::clone(&max_inside);
                thread::spawn(move || {
                    let lock = chart_lock(&path);
                    let _guard = lock.lock();
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(10));
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }
}

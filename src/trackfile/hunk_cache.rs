//! One-slot hunk cache with a background prefetch worker
//!
//! Each CHD track file owns one worker thread which holds the hunk source
//! exclusively. Every fetch, foreground or background, is a request to that
//! worker answered over a single-use channel, so at most one hunk read is in
//! flight per file. The cache keeps the current hunk plus at most one
//! outstanding prefetch for the hunk after it.

use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use tracing::{debug, trace, warn};

use crate::error::{ImageError, Result};

// =============================================================================
// Hunk Source
// =============================================================================

/// Something that can decompress whole hunks by index
pub trait HunkSource {
    fn hunk_count(&self) -> u32;
    fn hunk_bytes(&self) -> u32;
    /// Decompress hunk `index` into `buf` (exactly `hunk_bytes` long)
    fn read_hunk(&mut self, index: u32, buf: &mut [u8]) -> Result<()>;
}

struct FetchRequest {
    hunk: u32,
    reply: SyncSender<std::result::Result<Vec<u8>, String>>,
}

struct Pending {
    hunk: u32,
    rx: Receiver<std::result::Result<Vec<u8>, String>>,
}

/// Fetch counters, mostly for tests and debug logging
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HunkCacheStats {
    /// Hunks read while the caller waited
    pub sync_fetches: u64,
    /// Prefetch requests handed to the worker
    pub prefetches_issued: u64,
    /// Prefetched hunks thrown away because a different hunk was wanted
    pub discarded_prefetches: u64,
}

struct CacheState {
    current: Option<(u32, Vec<u8>)>,
    next: Option<Pending>,
    requests: Option<SyncSender<FetchRequest>>,
    /// Set once a prefetch fails; later reads fetch synchronously only
    worker_failed: bool,
    stats: HunkCacheStats,
}

// =============================================================================
// Hunk Cache
// =============================================================================

pub struct HunkCache {
    state: Mutex<CacheState>,
    worker: Mutex<Option<JoinHandle<()>>>,
    hunk_count: u32,
    hunk_bytes: u32,
}

impl HunkCache {
    /// Start the worker; `open` runs on the worker thread and builds the source
    pub fn spawn<S, F>(open: F) -> Result<Self>
    where
        S: HunkSource + 'static,
        F: FnOnce() -> Result<S> + Send + 'static,
    {
        let (req_tx, req_rx) = mpsc::sync_channel::<FetchRequest>(1);
        let (ready_tx, ready_rx) = mpsc::sync_channel::<std::result::Result<(u32, u32), String>>(1);

        let handle = thread::Builder::new()
            .name("chd-prefetch".into())
            .spawn(move || {
                let mut source = match open() {
                    Ok(source) => {
                        let _ = ready_tx.send(Ok((source.hunk_count(), source.hunk_bytes())));
                        source
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.to_string()));
                        return;
                    }
                };
                worker_loop(&mut source, req_rx);
            })
            .map_err(|e| ImageError::Chd(format!("failed to start prefetch worker: {}", e)))?;

        let (hunk_count, hunk_bytes) = match ready_rx.recv() {
            Ok(Ok(dims)) => dims,
            Ok(Err(msg)) => {
                let _ = handle.join();
                return Err(ImageError::Chd(msg));
            }
            Err(_) => {
                let _ = handle.join();
                return Err(ImageError::Chd("prefetch worker exited during open".into()));
            }
        };

        debug!(hunk_count, hunk_bytes, "Hunk cache ready");

        Ok(Self {
            state: Mutex::new(CacheState {
                current: None,
                next: None,
                requests: Some(req_tx),
                worker_failed: false,
                stats: HunkCacheStats::default(),
            }),
            worker: Mutex::new(Some(handle)),
            hunk_count,
            hunk_bytes,
        })
    }

    pub fn hunk_count(&self) -> u32 {
        self.hunk_count
    }

    pub fn hunk_bytes(&self) -> u32 {
        self.hunk_bytes
    }

    pub fn stats(&self) -> HunkCacheStats {
        self.lock().stats
    }

    /// Whether the background path has failed and prefetching is disabled
    pub fn prefetch_disabled(&self) -> bool {
        self.lock().worker_failed
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `f` over the contents of hunk `hunk`, fetching it if needed
    pub fn with_hunk<R>(&self, hunk: u32, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        if hunk >= self.hunk_count {
            return Err(ImageError::ChdHunkReadFailed {
                hunk,
                message: format!("hunk out of range (count {})", self.hunk_count),
            });
        }

        let mut state = self.lock();

        if let Some((idx, data)) = &state.current {
            if *idx == hunk {
                return Ok(f(data));
            }
        }

        let mut data = None;
        match state.next.take() {
            Some(pending) if pending.hunk == hunk => match pending.rx.recv() {
                Ok(Ok(buf)) => {
                    trace!(hunk, "Prefetch hit");
                    data = Some(buf);
                }
                Ok(Err(msg)) => mark_failed(&mut state, hunk, &msg),
                Err(_) => mark_failed(&mut state, hunk, "worker hung up"),
            },
            Some(pending) => {
                // Wait for the stale read to finish before issuing another
                if let Ok(Err(msg)) = pending.rx.recv() {
                    mark_failed(&mut state, pending.hunk, &msg);
                }
                state.stats.discarded_prefetches += 1;
                trace!(wanted = hunk, discarded = pending.hunk, "Discarded stale prefetch");
            }
            None => {}
        }

        let data = match data {
            Some(buf) => buf,
            None => {
                state.stats.sync_fetches += 1;
                fetch_blocking(&state, hunk)?
            }
        };

        let next = hunk + 1;
        if !state.worker_failed && next < self.hunk_count {
            if let Some(pending) = issue(&state, next) {
                state.next = Some(pending);
                state.stats.prefetches_issued += 1;
            }
        }

        let (_, data) = state.current.insert((hunk, data));
        Ok(f(data))
    }

    /// Stop the worker and wait for it to exit
    ///
    /// Safe to call more than once; later reads fail.
    pub fn shutdown(&self) {
        {
            let mut state = self.lock();
            state.requests = None;
            if let Some(pending) = state.next.take() {
                let _ = pending.rx.recv();
            }
        }
        let handle = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("CHD prefetch worker panicked");
            }
            debug!("CHD prefetch worker stopped");
        }
    }
}

impl Drop for HunkCache {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn mark_failed(state: &mut CacheState, hunk: u32, msg: &str) {
    if !state.worker_failed {
        warn!(hunk, "CHD prefetch failed, falling back to synchronous reads: {}", msg);
        state.worker_failed = true;
    }
}

fn issue(state: &CacheState, hunk: u32) -> Option<Pending> {
    let requests = state.requests.as_ref()?;
    let (reply, rx) = mpsc::sync_channel(1);
    requests.send(FetchRequest { hunk, reply }).ok()?;
    Some(Pending { hunk, rx })
}

fn fetch_blocking(state: &CacheState, hunk: u32) -> Result<Vec<u8>> {
    let failed = |message: String| ImageError::ChdHunkReadFailed { hunk, message };
    let pending = issue(state, hunk).ok_or_else(|| failed("prefetch worker is not running".into()))?;
    match pending.rx.recv() {
        Ok(Ok(buf)) => Ok(buf),
        Ok(Err(msg)) => Err(failed(msg)),
        Err(_) => Err(failed("prefetch worker hung up".into())),
    }
}

fn worker_loop<S: HunkSource>(source: &mut S, requests: Receiver<FetchRequest>) {
    let hunk_bytes = source.hunk_bytes() as usize;
    while let Ok(req) = requests.recv() {
        let mut buf = vec![0u8; hunk_bytes];
        let result = source
            .read_hunk(req.hunk, &mut buf)
            .map(|_| buf)
            .map_err(|e| e.to_string());
        let _ = req.reply.send(result);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    /// In-memory hunks; hunk `i` is filled with byte `i`
    pub(crate) struct MemorySource {
        pub hunks: u32,
        pub bytes: u32,
        pub reads: Arc<AtomicU64>,
        pub fail_hunk: Option<u32>,
    }

    impl HunkSource for MemorySource {
        fn hunk_count(&self) -> u32 {
            self.hunks
        }

        fn hunk_bytes(&self) -> u32 {
            self.bytes
        }

        fn read_hunk(&mut self, index: u32, buf: &mut [u8]) -> Result<()> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if self.fail_hunk == Some(index) {
                return Err(ImageError::Chd(format!("bad hunk {}", index)));
            }
            buf.fill(index as u8);
            Ok(())
        }
    }

    fn cache(hunks: u32, fail_hunk: Option<u32>) -> (HunkCache, Arc<AtomicU64>) {
        let reads = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&reads);
        let cache = HunkCache::spawn(move || {
            Ok(MemorySource {
                hunks,
                bytes: 64,
                reads: counter,
                fail_hunk,
            })
        })
        .unwrap();
        (cache, reads)
    }

    #[test]
    fn test_sequential_reads_fetch_synchronously_once() {
        let (cache, _) = cache(8, None);
        for hunk in 0..8 {
            let first = cache.with_hunk(hunk, |d| d[0]).unwrap();
            assert_eq!(first, hunk as u8);
        }
        let stats = cache.stats();
        assert_eq!(stats.sync_fetches, 1);
        assert_eq!(stats.prefetches_issued, 7);
        assert_eq!(stats.discarded_prefetches, 0);
    }

    #[test]
    fn test_repeat_read_is_free() {
        let (cache, reads) = cache(4, None);
        cache.with_hunk(2, |_| ()).unwrap();
        let stats_before = cache.stats();
        cache.with_hunk(2, |_| ()).unwrap();
        assert_eq!(cache.stats(), stats_before);

        cache.shutdown();
        // hunk 2 plus the prefetch of hunk 3
        assert_eq!(reads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_skip_ahead_discards_prefetch() {
        let (cache, _) = cache(8, None);
        cache.with_hunk(3, |_| ()).unwrap();
        let value = cache.with_hunk(5, |d| d[10]).unwrap();
        assert_eq!(value, 5);

        let stats = cache.stats();
        assert_eq!(stats.sync_fetches, 2);
        assert_eq!(stats.discarded_prefetches, 1);
        assert_eq!(stats.prefetches_issued, 2);
    }

    #[test]
    fn test_prefetch_failure_disables_prefetching() {
        let (cache, _) = cache(8, Some(1));
        cache.with_hunk(0, |_| ()).unwrap();

        // Prefetch of hunk 1 failed; the synchronous retry fails too
        let err = cache.with_hunk(1, |_| ()).unwrap_err();
        assert!(matches!(err, ImageError::ChdHunkReadFailed { hunk: 1, .. }));
        assert!(cache.prefetch_disabled());

        assert_eq!(cache.with_hunk(2, |d| d[0]).unwrap(), 2);
        assert_eq!(cache.with_hunk(3, |d| d[0]).unwrap(), 3);
        let stats = cache.stats();
        assert_eq!(stats.prefetches_issued, 1);
        assert_eq!(stats.sync_fetches, 4);
    }

    #[test]
    fn test_out_of_range_and_shutdown() {
        let (cache, _) = cache(2, None);
        assert!(cache.with_hunk(2, |_| ()).is_err());
        cache.with_hunk(0, |_| ()).unwrap();
        cache.shutdown();
        cache.shutdown();
        assert!(cache.with_hunk(1, |_| ()).is_err());
    }

    #[test]
    fn test_open_failure_is_reported() {
        let result = HunkCache::spawn(|| -> Result<MemorySource> {
            Err(ImageError::Chd("no such file".into()))
        });
        assert!(matches!(result, Err(ImageError::Chd(_))));
    }
}

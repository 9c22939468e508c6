//! Background worker that prunes expired semantic-cache entries.
//!
//! Runs on a dedicated OS thread with `std::thread::sleep` between
//! iterations. Ingest never clears the semantic cache; this sweeper is what
//! keeps stale entries from sitting in memory past their TTL when no query
//! happens to touch them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tracing::info;

use crate::serving::KnowledgeBase;

/// Global shutdown flag for the sweeper.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// Worker handle; set at most once per process.
static WORKER: OnceLock<std::thread::JoinHandle<()>> = OnceLock::new();

/// How often the sweeper wakes up.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Start the sweeper. Subsequent calls are no-ops.
pub fn start(kb: &Arc<KnowledgeBase>) {
    let kb = Arc::clone(kb);
    let _ = WORKER.get_or_init(|| {
        SHUTDOWN.store(false, Ordering::Release);
        std::thread::Builder::new()
            .name("kb-cache-sweeper".into())
            .spawn(move || sweep_loop(&kb))
            .expect("failed to spawn cache sweeper")
    });
}

/// Signal the sweeper to stop. The thread exits on its next wakeup.
pub fn shutdown() {
    SHUTDOWN.store(true, Ordering::Release);
}

fn sweep_loop(kb: &KnowledgeBase) {
    info!(interval_secs = SWEEP_INTERVAL.as_secs(), "cache sweeper started");
    loop {
        // Sleep in short slices so shutdown is honored promptly.
        for _ in 0..SWEEP_INTERVAL.as_secs() {
            if SHUTDOWN.load(Ordering::Acquire) {
                info!("cache sweeper shutting down");
                return;
            }
            std::thread::sleep(Duration::from_secs(1));
        }
        kb.sweep_semantic_caches();
    }
}

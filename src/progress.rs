//! Transfer progress shared between a session and whoever displays it

use std::future::Future;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// Byte counter owned by one session. Clones observe the same counter.
#[derive(Debug, Clone, Default)]
pub struct Progress {
    inner: Arc<Counters>,
}

#[derive(Debug, Default)]
struct Counters {
    transferred: AtomicU64,
    total: AtomicU64,
    complete: AtomicBool,
}

impl Progress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the negotiated file size and reset the counter.
    pub(crate) fn begin(&self, total: u64) {
        self.inner.total.store(total, Ordering::Relaxed);
        self.inner.transferred.store(0, Ordering::Relaxed);
        self.inner.complete.store(false, Ordering::Relaxed);
    }

    pub(crate) fn advance(&self, bytes: u64) -> u64 {
        self.inner.transferred.fetch_add(bytes, Ordering::Relaxed) + bytes
    }

    pub(crate) fn finish(&self) {
        self.inner.complete.store(true, Ordering::Relaxed);
    }

    pub fn transferred(&self) -> u64 {
        self.inner.transferred.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.inner.total.load(Ordering::Relaxed)
    }

    pub fn is_complete(&self) -> bool {
        self.inner.complete.load(Ordering::Relaxed)
    }

    /// `floor(transferred / total * 100)`, clamped to 100.
    pub fn percent(&self) -> u8 {
        let total = self.total();
        if total == 0 {
            return if self.is_complete() { 100 } else { 0 };
        }
        let pct = self.transferred() as u128 * 100 / total as u128;
        pct.min(100) as u8
    }
}

/// Await `work`, redrawing a percentage line on stderr every `interval`.
///
/// Display only: the counter is read, never waited on.
pub async fn display_while<F: Future>(work: F, progress: &Progress, interval: Duration) -> F::Output {
    tokio::pin!(work);
    let mut ticker = tokio::time::interval(interval);
    let mut shown = None;

    let output = loop {
        tokio::select! {
            output = &mut work => break output,
            _ = ticker.tick() => {
                let pct = progress.percent();
                if shown != Some(pct) {
                    draw(progress, pct);
                    shown = Some(pct);
                }
            }
        }
    };

    if shown.is_some() {
        if progress.is_complete() {
            draw(progress, progress.percent());
        }
        eprintln!();
    }
    output
}

fn draw(progress: &Progress, pct: u8) {
    let mut err = std::io::stderr();
    let _ = write!(err, "\r{:>3}% ({} / {} bytes)", pct, progress.transferred(), progress.total());
    let _ = err.flush();
}

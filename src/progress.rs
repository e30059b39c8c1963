use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use humansize::{BINARY, format_size};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Byte counters shared between upload jobs and the reporter.
#[derive(Debug)]
pub struct Progress {
    total: u64,
    uploaded: AtomicU64,
}

impl Progress {
    pub fn new(total: u64) -> Arc<Self> {
        Arc::new(Self {
            total,
            uploaded: AtomicU64::new(0),
        })
    }

    pub fn uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::Relaxed)
    }

    pub fn remaining(&self) -> u64 {
        self.total.saturating_sub(self.uploaded())
    }

    pub fn add(&self, bytes: u64) {
        self.uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn log(&self) {
        info!(
            uploaded = %format_size(self.uploaded(), BINARY),
            total = %format_size(self.total, BINARY),
            remaining = %format_size(self.remaining(), BINARY),
            "upload progress"
        );
    }

    /// Logs progress every `period` until `stop` is cancelled.
    pub fn spawn_reporter(
        self: Arc<Self>,
        period: Duration,
        stop: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => self.log(),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_bytes() {
        let progress = Progress::new(100);
        progress.add(30);
        progress.add(20);

        assert_eq!(progress.uploaded(), 50);
        assert_eq!(progress.remaining(), 50);

        progress.add(70);
        assert_eq!(progress.remaining(), 0);
    }

    #[tokio::test]
    async fn reporter_stops_on_cancel() {
        let progress = Progress::new(10);
        let stop = CancellationToken::new();
        let reporter = progress.spawn_reporter(Duration::from_millis(5), stop.clone());

        tokio::time::sleep(Duration::from_millis(20)).await;
        stop.cancel();
        reporter.await.unwrap();
    }
}

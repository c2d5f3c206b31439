//! Periodic counter sampling during a throughput test.
//!
//! Samples `CurCwnd` every `snap_delay` to find congestion-window peaks, and
//! optionally appends each sample to a CSV snaplog.

use std::os::fd::RawFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ndt_diag::{CwndPeaks, CwndTrend};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::counters::CounterStore;

pub const SNAPLOG_HEADER: &str = "elapsed_ms,CurCwnd,InFlight,CurMSS,SmoothedRTT\n";

#[derive(Debug, Clone, Copy, Default)]
pub struct SamplerOutcome {
    pub peaks: CwndPeaks,
    pub trend: CwndTrend,
    pub samples: u64,
}

pub struct CwndSampler {
    stop: watch::Sender<bool>,
    handle: JoinHandle<SamplerOutcome>,
}

impl CwndSampler {
    pub fn spawn(
        store: Arc<dyn CounterStore>,
        fd: RawFd,
        delay: Duration,
        snaplog: Option<PathBuf>,
    ) -> Self {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut out = SamplerOutcome::default();
            let mut log = match snaplog {
                Some(path) => open_snaplog(path).await,
                None => None,
            };
            let started = tokio::time::Instant::now();
            let mut ticker = tokio::time::interval(delay);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => {}
                }
                let counters = match store.snapshot(fd) {
                    Ok(c) => c,
                    Err(e) => {
                        tracing::debug!(error = %e, "cwnd sampling stopped");
                        break;
                    }
                };
                out.peaks.observe(counters.current_cwnd);
                out.trend.observe(counters.current_cwnd);
                out.samples += 1;
                if let Some(w) = log.as_mut() {
                    let row = format!(
                        "{},{},{},{},{}\n",
                        started.elapsed().as_millis(),
                        counters.current_cwnd,
                        counters.in_flight(),
                        counters.current_mss,
                        counters.smoothed_rtt
                    );
                    if let Err(e) = w.write_all(row.as_bytes()).await {
                        tracing::warn!(error = %e, "snaplog write failed");
                        log = None;
                    }
                }
            }
            if let Some(mut w) = log {
                let _ = w.flush().await;
            }
            out
        });
        CwndSampler {
            stop: stop_tx,
            handle,
        }
    }

    pub async fn stop(self) -> SamplerOutcome {
        let _ = self.stop.send(true);
        match self.handle.await {
            Ok(out) => out,
            Err(e) => {
                tracing::warn!(error = %e, "cwnd sampler task failed");
                SamplerOutcome::default()
            }
        }
    }
}

async fn open_snaplog(path: PathBuf) -> Option<BufWriter<tokio::fs::File>> {
    let file = match tokio::fs::File::create(&path).await {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "cannot create snaplog");
            return None;
        }
    };
    let mut w = BufWriter::new(file);
    w.write_all(SNAPLOG_HEADER.as_bytes()).await.ok()?;
    Some(w)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::CounterError;
    use ndt_diag::TcpCounters;
    use std::sync::atomic::{AtomicI64, Ordering};

    /// Replays a cwnd sawtooth, one step per snapshot.
    struct Sawtooth {
        step: AtomicI64,
    }

    impl CounterStore for Sawtooth {
        fn snapshot(&self, _fd: RawFd) -> Result<TcpCounters, CounterError> {
            const SHAPE: [i64; 8] = [10, 20, 40, 30, 35, 50, 25, 30];
            let i = self.step.fetch_add(1, Ordering::Relaxed) as usize;
            let mut c = TcpCounters::unavailable();
            c.current_cwnd = SHAPE[i.min(SHAPE.len() - 1)];
            c.current_mss = 1448;
            Ok(c)
        }

        fn limit_cwnd(&self, _fd: RawFd, _bytes: u32) -> Result<(), CounterError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn sampler_tracks_peaks_and_writes_snaplog() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snap.csv");
        let store = Arc::new(Sawtooth {
            step: AtomicI64::new(0),
        });
        let sampler = CwndSampler::spawn(store, 0, Duration::from_millis(2), Some(path.clone()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        let out = sampler.stop().await;

        assert!(out.samples >= 8);
        assert!(!out.peaks.in_slow_start());
        assert_eq!(out.peaks.max, 50);
        assert_eq!(out.peaks.amount, 2);

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with(SNAPLOG_HEADER));
        assert!(text.lines().count() > 8);
    }
}

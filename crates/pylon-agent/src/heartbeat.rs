//! Heartbeat supervision: periodic probes and client silence detection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Monotonic record of the last time a client proved it was alive.
#[derive(Debug)]
pub struct ActivityClock {
    origin: Instant,
    last_ms: AtomicU64,
}

impl ActivityClock {
    /// Clock whose last activity is now.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    /// Record activity now.
    pub fn touch(&self) {
        let _ = self.last_ms.fetch_max(self.elapsed_ms(), Ordering::Relaxed);
    }

    /// Time since the last recorded activity.
    pub fn idle_for(&self) -> Duration {
        let last = self.last_ms.load(Ordering::Relaxed);
        Duration::from_millis(self.elapsed_ms().saturating_sub(last))
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of the heartbeat loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// The client stayed silent for the whole timeout window.
    TimedOut,
    /// The probe could not be handed to the writer.
    ProbeFailed,
    /// The loop was stopped from outside.
    Cancelled,
}

/// Probe the client every `interval` and detect silence.
///
/// The first check happens one full interval after start. A client idle for
/// at least `timeout` ends the loop with [`HeartbeatResult::TimedOut`];
/// otherwise `probe` is queued for the writer. The loop only ever waits on
/// its ticker or `cancel`: a probe that finds the raw queue full is skipped.
pub async fn run_heartbeat(
    clock: &ActivityClock,
    probe: Bytes,
    raw_tx: mpsc::Sender<Bytes>,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) -> HeartbeatResult {
    let mut ticker = time::interval_at(Instant::now() + interval, interval);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return HeartbeatResult::Cancelled,
            _ = ticker.tick() => {}
        }

        if clock.idle_for() >= timeout {
            return HeartbeatResult::TimedOut;
        }

        match raw_tx.try_send(probe.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => debug!("raw queue full, heartbeat probe skipped"),
            Err(TrySendError::Closed(_)) => return HeartbeatResult::ProbeFailed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const PROBE: &[u8] = b"\x03\x00\x00\x00";

    fn spawn(
        clock: Arc<ActivityClock>,
        raw_tx: mpsc::Sender<Bytes>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<HeartbeatResult> {
        tokio::spawn(async move {
            run_heartbeat(
                &clock,
                Bytes::from_static(PROBE),
                raw_tx,
                interval,
                interval * 2,
                cancel,
            )
            .await
        })
    }

    #[tokio::test(start_paused = true)]
    async fn idle_clock_tracks_touches() {
        let clock = ActivityClock::new();
        time::advance(Duration::from_millis(1500)).await;
        assert_eq!(clock.idle_for(), Duration::from_millis(1500));
        clock.touch();
        assert_eq!(clock.idle_for(), Duration::ZERO);
        time::advance(Duration::from_millis(20)).await;
        assert_eq!(clock.idle_for(), Duration::from_millis(20));
    }

    #[tokio::test]
    async fn heartbeat_cancelled() {
        let (tx, _rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let handle = spawn(
            Arc::new(ActivityClock::new()),
            tx,
            Duration::from_secs(100),
            cancel.clone(),
        );

        cancel.cancel();
        assert_eq!(handle.await.unwrap(), HeartbeatResult::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_client_times_out_on_second_tick() {
        let (tx, mut rx) = mpsc::channel(4);
        let start = Instant::now();
        let handle = spawn(
            Arc::new(ActivityClock::new()),
            tx,
            Duration::from_secs(1),
            CancellationToken::new(),
        );

        assert_eq!(handle.await.unwrap(), HeartbeatResult::TimedOut);
        assert_eq!(start.elapsed(), Duration::from_secs(2));
        // One probe went out at the first tick.
        assert_eq!(&rx.recv().await.unwrap()[..], PROBE);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn active_client_keeps_getting_probes() {
        let (tx, mut rx) = mpsc::channel(16);
        let clock = Arc::new(ActivityClock::new());
        let cancel = CancellationToken::new();
        let handle = spawn(clock.clone(), tx, Duration::from_secs(1), cancel.clone());

        for _ in 0..5 {
            time::sleep(Duration::from_millis(900)).await;
            clock.touch();
        }
        cancel.cancel();
        assert_eq!(handle.await.unwrap(), HeartbeatResult::Cancelled);

        let mut probes = 0;
        while rx.try_recv().is_ok() {
            probes += 1;
        }
        assert_eq!(probes, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_writer_fails_probe() {
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let handle = spawn(
            Arc::new(ActivityClock::new()),
            tx,
            Duration::from_secs(1),
            CancellationToken::new(),
        );
        assert_eq!(handle.await.unwrap(), HeartbeatResult::ProbeFailed);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_while_probe_queue_is_full() {
        let (tx, _rx) = mpsc::channel(1);
        tx.try_send(Bytes::from_static(b"filler")).unwrap();
        let clock = Arc::new(ActivityClock::new());
        let cancel = CancellationToken::new();
        let handle = spawn(clock.clone(), tx, Duration::from_secs(1), cancel.clone());

        time::sleep(Duration::from_millis(1500)).await;
        cancel.cancel();
        assert_eq!(handle.await.unwrap(), HeartbeatResult::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn full_raw_queue_still_detects_silence() {
        let (tx, mut rx) = mpsc::channel(1);
        tx.try_send(Bytes::from_static(b"filler")).unwrap();
        let clock = Arc::new(ActivityClock::new());
        let handle = spawn(
            clock.clone(),
            tx,
            Duration::from_secs(1),
            CancellationToken::new(),
        );

        // Active while the queue stays full.
        for _ in 0..6 {
            time::sleep(Duration::from_millis(500)).await;
            clock.touch();
        }
        let silent_from = Instant::now();
        assert_eq!(handle.await.unwrap(), HeartbeatResult::TimedOut);
        assert!(silent_from.elapsed() <= Duration::from_secs(3));

        assert_eq!(&rx.recv().await.unwrap()[..], b"filler");
        assert!(rx.recv().await.is_none());
    }
}

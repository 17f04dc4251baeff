//! The per-instance round timer.
//!
//! Each armed round is a tokio task that sleeps and then delivers a
//! [`RoundTimeout`] on the instance's timeout channel. Re-arming cancels the
//! previous task, so at most one timeout per instance is ever pending.

use dvq_types::{Height, Round};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Delivered when a round's timer expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundTimeout {
    pub height: Height,
    pub round: Round,
}

/// Monotonically lengthening round timer.
///
/// Round `r` times out after `base · 2^min(r-1, max_exponent)`.
#[derive(Debug)]
pub struct RoundTimer {
    base: Duration,
    max_exponent: u32,
    tx: mpsc::Sender<RoundTimeout>,
    handle: Option<JoinHandle<()>>,
}

impl RoundTimer {
    pub fn new(base: Duration, max_exponent: u32, tx: mpsc::Sender<RoundTimeout>) -> RoundTimer {
        RoundTimer {
            base,
            max_exponent,
            tx,
            handle: None,
        }
    }

    /// Timeout for a given round.
    pub fn duration_for(&self, round: Round) -> Duration {
        let exponent = (round.0.saturating_sub(1)).min(self.max_exponent as u64) as u32;
        self.base * 2u32.pow(exponent)
    }

    /// Arm the timer for a round, replacing any pending one.
    pub fn register(&mut self, height: Height, round: Round) {
        self.cancel();

        let duration = self.duration_for(round);
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            trace!(%height, %round, ?duration, "round timer armed");
            tokio::time::sleep(duration).await;
            // The receiver going away just means the instance terminated.
            let _ = tx.send(RoundTimeout { height, round }).await;
        });
        self.handle = Some(handle);
        debug!(%height, %round, ?duration, "round timer set");
    }

    /// Cancel the pending timer, if any.
    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for RoundTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timer(tx: mpsc::Sender<RoundTimeout>) -> RoundTimer {
        RoundTimer::new(Duration::from_millis(10), 6, tx)
    }

    #[test]
    fn schedule_doubles_and_caps() {
        let (tx, _rx) = mpsc::channel(1);
        let t = RoundTimer::new(Duration::from_secs(2), 6, tx);
        assert_eq!(t.duration_for(Round(1)), Duration::from_secs(2));
        assert_eq!(t.duration_for(Round(2)), Duration::from_secs(4));
        assert_eq!(t.duration_for(Round(4)), Duration::from_secs(16));
        // Capped at 2^6.
        assert_eq!(t.duration_for(Round(7)), Duration::from_secs(128));
        assert_eq!(t.duration_for(Round(20)), Duration::from_secs(128));
    }

    #[tokio::test]
    async fn fires_with_height_and_round() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut t = timer(tx);
        t.register(Height(5), Round(1));

        let fired = tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .expect("timer should fire")
            .expect("channel open");
        assert_eq!(
            fired,
            RoundTimeout {
                height: Height(5),
                round: Round(1)
            }
        );
    }

    #[tokio::test]
    async fn cancel_prevents_fire() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut t = timer(tx);
        t.register(Height(0), Round(1));
        t.cancel();

        let result = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(result.is_err(), "cancelled timer must not fire");
    }

    #[tokio::test]
    async fn rearming_replaces_pending_round() {
        let (tx, mut rx) = mpsc::channel(2);
        let mut t = timer(tx);
        t.register(Height(0), Round(1));
        t.register(Height(0), Round(2));

        let fired = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("timer should fire")
            .expect("channel open");
        assert_eq!(fired.round, Round(2));

        // And nothing else is pending.
        let extra = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(extra.is_err());
    }
}

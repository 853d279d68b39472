//! Cancelable countdowns owned by a session

use std::time::Duration;
use tokio::time::{sleep_until, Instant};

/// One countdown. A disarmed timer never fires.
#[derive(Debug, Default)]
pub struct Timer {
    deadline: Option<Instant>,
}

impl Timer {
    pub fn arm(&mut self, after: Duration) {
        self.deadline = Some(Instant::now() + after);
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Completes at the deadline; pending forever while disarmed. The caller
    /// disarms or re-arms the timer when handling the expiry.
    pub async fn expired(&self) {
        match self.deadline {
            Some(deadline) => sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }
}

/// Every timer a session runs
#[derive(Debug, Default)]
pub struct Timers {
    /// Limit for the current state
    pub state: Timer,
    /// Silence tolerated before disconnecting
    pub activity: Timer,
    /// Idle time before a liveness probe
    pub ping: Timer,
    /// Progress deadline of the held job
    pub job: Timer,
    /// Next `getaddr`
    pub peers: Timer,
    /// Next attempt to obtain a job
    pub dispatch: Timer,
}

impl Timers {
    pub fn cancel_all(&mut self) {
        self.state.cancel();
        self.activity.cancel();
        self.ping.cancel();
        self.job.cancel();
        self.peers.cancel();
        self.dispatch.cancel();
    }

    pub fn any_armed(&self) -> bool {
        self.state.is_armed()
            || self.activity.is_armed()
            || self.ping.is_armed()
            || self.job.is_armed()
            || self.peers.is_armed()
            || self.dispatch.is_armed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_deadline() {
        let mut timer = Timer::default();
        timer.arm(Duration::from_secs(30));
        let start = Instant::now();
        timer.expired().await;
        assert!(start.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarmed_never_fires() {
        let mut timer = Timer::default();
        timer.arm(Duration::from_secs(1));
        timer.cancel();
        let fired = tokio::time::timeout(Duration::from_secs(3600), timer.expired()).await;
        assert!(fired.is_err());
    }

    #[test]
    fn test_cancel_all() {
        let mut timers = Timers::default();
        timers.state.arm(Duration::from_secs(1));
        timers.job.arm(Duration::from_secs(1));
        assert!(timers.any_armed());
        timers.cancel_all();
        assert!(!timers.any_armed());
    }
}

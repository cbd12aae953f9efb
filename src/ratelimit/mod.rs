//! Credit-based rate limiter (design §4.10), used to pace byte streams
//! (e.g. the overlay bridge's outgoing transfer parts).
//!
//! Modeled as a single actor task (per §5's "cooperative actors over
//! preemptive threads" design note) owning a FIFO of pending grants plus
//! an `unlock_at` clock: each granted `size` pushes `unlock_at` forward by
//! `size / max_rate` seconds, and the queue head's `execute_at` is the
//! next alarm deadline.

use std::collections::VecDeque;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};

use crate::actor::Alarm;
use crate::error::{ProxyError, ProxyResult};

struct QueueEntry {
    execute_at: Instant,
    size: u64,
    deadline: Option<Instant>,
    promise: oneshot::Sender<ProxyResult<()>>,
}

enum Cmd {
    Enqueue {
        size: u64,
        deadline: Option<Instant>,
        promise: oneshot::Sender<ProxyResult<()>>,
    },
    SetRate(f64),
}

struct State {
    max_rate: f64,
    unlock_at: Instant,
    queue: VecDeque<QueueEntry>,
}

impl State {
    fn new(max_rate: f64) -> Self {
        Self {
            max_rate,
            unlock_at: Instant::now(),
            queue: VecDeque::new(),
        }
    }

    /// Computes how far `unlock_at` advances for granting `size` bytes at
    /// the current `max_rate`. Only meaningful for `max_rate > 0`.
    fn advance(&self, size: u64) -> Duration {
        Duration::from_secs_f64(size as f64 / self.max_rate)
    }

    fn enqueue(&mut self, size: u64, deadline: Option<Instant>, promise: oneshot::Sender<ProxyResult<()>>) {
        if self.max_rate < 0.0 {
            let _ = promise.send(Ok(()));
            return;
        }
        if self.max_rate == 0.0 {
            let _ = promise.send(Err(ProxyError::UpstreamUnavailable("rate limited".into())));
            return;
        }
        let now = Instant::now();
        if self.unlock_at <= now && self.queue.is_empty() {
            self.unlock_at = now + self.advance(size);
            let _ = promise.send(Ok(()));
            return;
        }
        let execute_at = self.unlock_at;
        self.unlock_at += self.advance(size);
        self.queue.push_back(QueueEntry { execute_at, size, deadline, promise });
    }

    /// Changes the rate without disturbing already-queued entries: each
    /// queued `execute_at` is a commitment made under the old rate and
    /// stays put. Only the tail point `unlock_at`, from which entries
    /// enqueued after this call get scheduled, moves: it's recomputed from
    /// the last queued entry's committed `execute_at` plus that entry's
    /// remaining size advanced at the new rate.
    fn set_rate(&mut self, max_rate: f64) {
        self.max_rate = max_rate;
        match self.queue.back() {
            Some(last) => self.unlock_at = last.execute_at + self.advance(last.size),
            None => self.unlock_at = self.unlock_at.max(Instant::now()),
        }
    }

    fn release_head(&mut self) {
        let Some(entry) = self.queue.pop_front() else { return };
        if let Some(deadline) = entry.deadline {
            if Instant::now() > deadline {
                let _ = entry.promise.send(Err(ProxyError::Timeout));
                return;
            }
        }
        let _ = entry.promise.send(Ok(()));
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.queue.front().map(|e| e.execute_at)
    }
}

/// Handle to a running rate-limiter actor.
#[derive(Clone)]
pub struct RateLimiter {
    tx: mpsc::UnboundedSender<Cmd>,
}

impl RateLimiter {
    pub fn new(max_rate: f64) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(State::new(max_rate), rx));
        Self { tx }
    }

    /// Grants `size` bytes of budget, resolving once permitted (or
    /// rejected, per §4.10's branches). `deadline` is `None` for "never".
    pub async fn enqueue(&self, size: u64, deadline: Option<Instant>) -> ProxyResult<()> {
        let (promise, rx) = oneshot::channel();
        if self.tx.send(Cmd::Enqueue { size, deadline, promise }).is_err() {
            return Err(ProxyError::Cancelled);
        }
        rx.await.unwrap_or(Err(ProxyError::Cancelled))
    }

    pub fn set_rate(&self, max_rate: f64) {
        let _ = self.tx.send(Cmd::SetRate(max_rate));
    }
}

async fn run(mut state: State, mut rx: mpsc::UnboundedReceiver<Cmd>) {
    let mut alarm = Alarm::idle();
    loop {
        if let Some(deadline) = state.next_deadline() {
            alarm.arm_at(deadline);
        } else {
            alarm.disarm();
        }
        tokio::select! {
            biased;
            _ = alarm.wait(), if alarm.is_armed() => {
                state.release_head();
            }
            cmd = rx.recv() => {
                match cmd {
                    Some(Cmd::Enqueue { size, deadline, promise }) => state.enqueue(size, deadline, promise),
                    Some(Cmd::SetRate(rate)) => state.set_rate(rate),
                    None => return,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn negative_rate_grants_unconditionally() {
        let limiter = RateLimiter::new(-1.0);
        limiter.enqueue(1_000_000, None).await.unwrap();
    }

    #[tokio::test]
    async fn zero_rate_rejects() {
        let limiter = RateLimiter::new(0.0);
        assert!(limiter.enqueue(1, None).await.is_err());
    }

    #[tokio::test]
    async fn scenario_four_from_spec() {
        tokio::time::pause();
        let limiter = RateLimiter::new(1000.0);
        let start = Instant::now();

        let t1 = tokio::time::Instant::now();
        limiter.enqueue(500, None).await.unwrap();
        assert!(t1.elapsed() < Duration::from_millis(5), "first grant is immediate");

        let limiter2 = limiter.clone();
        let p2 = tokio::spawn(async move { limiter2.enqueue(500, None).await });
        tokio::task::yield_now().await;

        // Rate changes between enqueueing p2 and p3: p2's committed +0.5s
        // schedule must survive untouched, and p3 is scheduled from p2's
        // frozen execute_at advanced at the new rate (+0.25s), landing at
        // +0.75s rather than the +1.0s the old rate would have produced.
        limiter.set_rate(2000.0);

        let limiter3 = limiter.clone();
        let p3 = tokio::spawn(async move { limiter3.enqueue(500, None).await });
        tokio::task::yield_now().await;

        tokio::time::advance(Duration::from_millis(490)).await;
        tokio::task::yield_now().await;
        assert!(!p2.is_finished(), "p2 must not resolve before its committed +0.5s");
        assert!(!p3.is_finished(), "p3 must not resolve before +0.75s");

        tokio::time::advance(Duration::from_millis(20)).await;
        tokio::task::yield_now().await;
        assert!(p2.is_finished(), "p2 resolves at its committed +0.5s");
        assert!(!p3.is_finished(), "p3 still must not resolve before +0.75s");

        tokio::time::advance(Duration::from_millis(240)).await;
        tokio::task::yield_now().await;
        assert!(!p3.is_finished(), "p3 must not resolve before +0.75s");

        tokio::time::advance(Duration::from_millis(20)).await;
        tokio::task::yield_now().await;
        assert!(p3.is_finished(), "p3 resolves at the rebuilt +0.75s, not the old rate's +1.0s");

        p2.await.unwrap().unwrap();
        p3.await.unwrap().unwrap();
        assert!(start.elapsed() >= Duration::from_millis(700));
    }

    #[tokio::test]
    async fn past_deadline_fails_with_timeout() {
        tokio::time::pause();
        let limiter = RateLimiter::new(1.0);
        limiter.enqueue(1, None).await.unwrap();

        let deadline = Instant::now() + Duration::from_millis(10);
        let result_task = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.enqueue(1, Some(deadline)).await })
        };
        tokio::time::advance(Duration::from_secs(5)).await;
        let result = result_task.await.unwrap();
        assert!(matches!(result, Err(ProxyError::Timeout)));
    }
}

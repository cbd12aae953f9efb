//! Thin scaffolding over `tokio::spawn` + channels that plays the role of
//! the cooperative-actor runtime described in the design (§5): one task per
//! long-lived conversation, a FIFO mailbox, and promise-style replies.
//!
//! This is deliberately not a general actor framework — each subsystem
//! (payload sender/receiver, request sender/handler, tunnel) spawns its own
//! task and owns its own mailbox type; this module only supplies the two
//! recurring primitives: a reply handle (`Promise`) and an alarm helper.

use tokio::sync::oneshot;
use tokio::time::{Duration, Instant};

/// A single-shot reply channel — the Rust analogue of the design's
/// "promise" crossing one actor boundary.
pub type Promise<T> = oneshot::Sender<T>;
pub type Future<T> = oneshot::Receiver<T>;

pub fn promise<T>() -> (Promise<T>, Future<T>) {
    oneshot::channel()
}

/// An alarm that can be rearmed to a new deadline. Actors poll this inside
/// `tokio::select!` alongside their mailbox instead of spawning a fresh
/// `sleep` future per rearm.
pub struct Alarm {
    deadline: Option<Instant>,
}

impl Alarm {
    pub fn idle() -> Self {
        Self { deadline: None }
    }

    pub fn arm_at(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
    }

    pub fn arm_in(&mut self, dur: Duration) {
        self.arm_at(Instant::now() + dur);
    }

    pub fn disarm(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Resolves once the armed deadline passes; never resolves while idle.
    pub async fn wait(&mut self) {
        match self.deadline {
            Some(d) => tokio::time::sleep_until(d).await,
            None => std::future::pending::<()>().await,
        }
    }
}

impl Default for Alarm {
    fn default() -> Self {
        Self::idle()
    }
}

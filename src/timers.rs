//! Keyed timer registry
//!
//! Every timer the engines and the session use goes through a registry: at
//! most one pending timer per kind, firings delivered as messages on the
//! owner's channel, and a single `clear_all` for teardown. Each scheduled
//! timer gets a sequence number so a firing that raced with a cancel or a
//! reschedule is recognised and dropped by `accept`.

use log::trace;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

/// A timer firing as delivered to the owner's channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired<K> {
    pub kind: K,
    pub seq: u64,
}

struct Pending {
    seq: u64,
    repeating: bool,
    handle: JoinHandle<()>,
}

pub struct TimerRegistry<K, M> {
    tx: UnboundedSender<M>,
    pending: HashMap<K, Pending>,
    next_seq: u64,
}

impl<K, M> TimerRegistry<K, M>
where
    K: Copy + Eq + Hash + Debug + Send + 'static,
    M: From<TimerFired<K>> + Send + 'static,
{
    pub fn new(tx: UnboundedSender<M>) -> Self {
        Self {
            tx,
            pending: HashMap::new(),
            next_seq: 0,
        }
    }

    /// Fire once after `delay`, replacing any pending timer of this kind
    pub fn schedule(&mut self, kind: K, delay: Duration) {
        let seq = self.bump(kind);
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            time::sleep(delay).await;
            let _ = tx.send(M::from(TimerFired { kind, seq }));
        });
        self.pending.insert(
            kind,
            Pending {
                seq,
                repeating: false,
                handle,
            },
        );
    }

    /// Fire every `period` until cancelled, replacing any pending timer of this kind
    pub fn schedule_repeating(&mut self, kind: K, period: Duration) {
        let seq = self.bump(kind);
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if tx.send(M::from(TimerFired { kind, seq })).is_err() {
                    break;
                }
            }
        });
        self.pending.insert(
            kind,
            Pending {
                seq,
                repeating: true,
                handle,
            },
        );
    }

    /// Cancel the pending timer of this kind; returns whether one was pending
    pub fn cancel(&mut self, kind: K) -> bool {
        match self.pending.remove(&kind) {
            Some(p) => {
                trace!("timer {:?} cancelled", kind);
                p.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self, kind: K) -> bool {
        self.pending.contains_key(&kind)
    }

    /// Check a firing against the registry. Stale firings return false.
    /// A current one-shot firing is consumed.
    pub fn accept(&mut self, fired: &TimerFired<K>) -> bool {
        let current = match self.pending.get(&fired.kind) {
            Some(p) => p.seq == fired.seq,
            None => false,
        };
        if !current {
            trace!("dropping stale {:?} firing", fired.kind);
            return false;
        }
        if let Some(p) = self.pending.get(&fired.kind) {
            if !p.repeating {
                self.pending.remove(&fired.kind);
            }
        }
        true
    }

    /// Cancel everything
    pub fn clear_all(&mut self) {
        for (_, p) in self.pending.drain() {
            p.handle.abort();
        }
    }

    fn bump(&mut self, kind: K) -> u64 {
        if let Some(p) = self.pending.remove(&kind) {
            p.handle.abort();
        }
        self.next_seq += 1;
        self.next_seq
    }
}

impl<K, M> Drop for TimerRegistry<K, M> {
    fn drop(&mut self) {
        for (_, p) in self.pending.drain() {
            p.handle.abort();
        }
    }
}

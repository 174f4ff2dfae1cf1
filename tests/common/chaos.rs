//! A transport wrapper that makes a reliable in-process transport behave like a bad network.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use lockstep_rollback::rng::{Pcg32, Rng, SeedableRng};
use lockstep_rollback::{Message, ParticipantIndex, Transport};

/// Loss, duplication and reordering rates in percent.
#[derive(Debug, Clone, Copy)]
pub struct ChaosConfig {
    pub loss: u32,
    pub duplication: u32,
    pub reorder: u32,
    pub seed: u64,
}

impl ChaosConfig {
    #[must_use]
    pub fn lossy(seed: u64) -> Self {
        Self {
            loss: 10,
            duplication: 5,
            reorder: 10,
            seed,
        }
    }
}

/// Wraps a transport and mangles outbound traffic.
///
/// Held-back envelopes are released after the next send, which swaps their order with it.
#[derive(Debug)]
pub struct ChaosTransport<T> {
    inner: T,
    config: ChaosConfig,
    rng: Pcg32,
    held_back: Vec<(Message, ParticipantIndex)>,
    pub dropped: usize,
    pub duplicated: usize,
    pub reordered: usize,
}

impl<T: Transport> ChaosTransport<T> {
    pub fn new(inner: T, config: ChaosConfig) -> Self {
        Self {
            inner,
            config,
            rng: Pcg32::seed_from_u64(config.seed),
            held_back: Vec::new(),
            dropped: 0,
            duplicated: 0,
            reordered: 0,
        }
    }

    fn roll(&mut self, percent: u32) -> bool {
        self.rng.gen_range(0..100) < percent
    }
}

impl<T: Transport> Transport for ChaosTransport<T> {
    fn send_to(&mut self, msg: &Message, to: ParticipantIndex) {
        if self.roll(self.config.loss) {
            self.dropped += 1;
            return;
        }
        if self.roll(self.config.reorder) {
            self.reordered += 1;
            self.held_back.push((msg.clone(), to));
            return;
        }
        self.inner.send_to(msg, to);
        if self.roll(self.config.duplication) {
            self.duplicated += 1;
            self.inner.send_to(msg, to);
        }
        for (held, to) in std::mem::take(&mut self.held_back) {
            self.inner.send_to(&held, to);
        }
    }

    fn recv(&mut self) -> Option<Message> {
        self.inner.recv()
    }
}

/// Wraps a transport and silently drops everything sent to one participant once the
/// shared switch names it. `usize::MAX` means nothing is cut.
#[derive(Debug)]
pub struct PartitionTransport<T> {
    inner: T,
    cut: Arc<AtomicUsize>,
}

impl<T: Transport> PartitionTransport<T> {
    pub fn new(inner: T) -> (Self, Arc<AtomicUsize>) {
        let cut = Arc::new(AtomicUsize::new(usize::MAX));
        (
            Self {
                inner,
                cut: Arc::clone(&cut),
            },
            cut,
        )
    }
}

impl<T: Transport> Transport for PartitionTransport<T> {
    fn send_to(&mut self, msg: &Message, to: ParticipantIndex) {
        if self.cut.load(Ordering::Relaxed) != to.as_usize() {
            self.inner.send_to(msg, to);
        }
    }

    fn recv(&mut self) -> Option<Message> {
        self.inner.recv()
    }
}

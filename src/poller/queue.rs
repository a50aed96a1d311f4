//! Per-poller fact queue: unbounded FIFO, one producer, one consumer.
//!
//! The producer half lives in the worker task; the consumer half stays
//! on the `PollerWorker` and is drained by the aggregator during a scrape.

use std::collections::BTreeMap;
use std::sync::Mutex;
use tokio::sync::mpsc::{self, error::TryRecvError};

/// Label name → value. Ordered, so iteration is already canonical.
pub type LabelSet = BTreeMap<String, String>;

/// One filtered instance observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fact {
    pub count: u64,
    pub labels: LabelSet,
}

impl Fact {
    pub fn single(labels: LabelSet) -> Self {
        Self { count: 1, labels }
    }
}

/// Create a connected producer/consumer pair.
pub fn fact_queue() -> (FactProducer, FactConsumer) {
    let (tx, rx) = mpsc::unbounded_channel();
    (FactProducer { tx }, FactConsumer { rx: Mutex::new(rx) })
}

#[derive(Clone)]
pub struct FactProducer {
    tx: mpsc::UnboundedSender<Fact>,
}

impl FactProducer {
    /// Never blocks. Once the consumer is gone the fact is discarded.
    pub fn enqueue(&self, fact: Fact) {
        if self.tx.send(fact).is_err() {
            tracing::trace!("Fact queue consumer dropped — discarding fact");
        }
    }
}

pub struct FactConsumer {
    rx: Mutex<mpsc::UnboundedReceiver<Fact>>,
}

impl FactConsumer {
    /// Remove and return every fact available right now, without waiting.
    pub fn drain_all(&self) -> Vec<Fact> {
        let mut rx = self.rx.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut facts = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(fact) => facts.push(fact),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        facts
    }
}

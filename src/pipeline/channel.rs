//! Depth-1 sample channel with most-recent-value semantics.
//!
//! The producer never blocks: when the slot still holds an unconsumed sample
//! the sender evicts it and stores the new one. The reader therefore only ever
//! sees the freshest sample, and never a backlog.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError, bounded};
use tokio::sync::watch;

use crate::{error::ChannelError, types::Sample};

/// Anything the producer loop can publish samples into.
pub trait SampleSink {
    fn publish(&mut self, sample: Sample) -> Result<(), ChannelError>;
}

#[derive(Debug)]
struct Shared {
    receiver_open: AtomicBool,
    overwritten: AtomicU64,
}

pub fn sample_channel() -> (SampleSender, SampleReceiver) {
    let (tx, rx) = bounded(1);
    let (alive_tx, alive_rx) = watch::channel(());
    let shared = Arc::new(Shared {
        receiver_open: AtomicBool::new(true),
        overwritten: AtomicU64::new(0),
    });

    let sender = SampleSender {
        tx,
        evict: rx.clone(),
        shared: shared.clone(),
        _alive: alive_tx,
    };
    let receiver = SampleReceiver {
        rx,
        shared,
        writer: alive_rx,
    };
    (sender, receiver)
}

#[derive(Debug)]
pub struct SampleSender {
    tx: Sender<Sample>,
    // Lets the writer drop a stale sample when the slot is full.
    evict: Receiver<Sample>,
    shared: Arc<Shared>,
    // Never written; dropping it wakes `SampleReceiver::writer_gone`.
    _alive: watch::Sender<()>,
}

impl SampleSender {
    pub fn send(&self, sample: Sample) -> Result<(), ChannelError> {
        if !self.shared.receiver_open.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }

        let mut pending = sample;
        loop {
            match self.tx.try_send(pending) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(rejected)) => {
                    if self.evict.try_recv().is_ok() {
                        self.shared.overwritten.fetch_add(1, Ordering::Relaxed);
                    }
                    pending = rejected;
                }
                Err(TrySendError::Disconnected(_)) => return Err(ChannelError::Closed),
            }
        }
    }

    /// Number of samples replaced before the reader consumed them.
    pub fn overwritten(&self) -> u64 {
        self.shared.overwritten.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        !self.shared.receiver_open.load(Ordering::Acquire)
    }

    /// Ends the stream. A sample already in the slot remains readable once.
    pub fn close(self) {}
}

impl SampleSink for SampleSender {
    fn publish(&mut self, sample: Sample) -> Result<(), ChannelError> {
        self.send(sample)
    }
}

#[derive(Debug)]
pub struct SampleReceiver {
    rx: Receiver<Sample>,
    shared: Arc<Shared>,
    writer: watch::Receiver<()>,
}

impl SampleReceiver {
    /// Non-blocking read of the most recent sample, if one is waiting.
    ///
    /// Returns `EndOfStream` only after the writer is gone and the slot has
    /// been drained, and `Closed` once [`SampleReceiver::close`] was called.
    pub fn try_recv(&self) -> Result<Option<Sample>, ChannelError> {
        if !self.shared.receiver_open.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }

        match self.rx.try_recv() {
            Ok(sample) => Ok(Some(sample)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(ChannelError::EndOfStream),
        }
    }

    /// Whether the writer has gone away. A last sample may still be waiting.
    pub fn writer_is_gone(&self) -> bool {
        self.writer.has_changed().is_err()
    }

    /// Resolves once the writer has gone away, without consuming samples.
    /// Cancel safe.
    pub async fn writer_gone(&self) {
        let mut writer = self.writer.clone();
        while writer.changed().await.is_ok() {}
    }

    pub fn close(&mut self) {
        self.shared.receiver_open.store(false, Ordering::Release);
        while self.rx.try_recv().is_ok() {}
    }

    pub fn overwritten(&self) -> u64 {
        self.shared.overwritten.load(Ordering::Relaxed)
    }
}

impl Drop for SampleReceiver {
    fn drop(&mut self) {
        self.shared.receiver_open.store(false, Ordering::Release);
    }
}

//! Lifecycle signal fabric.
//!
//! Three channels decouple "a message finished processing" from "what happens
//! next": acks go to the subscriber's offset committer, nacks to the retrier,
//! quarantines to the dead-letter sink. They are created once per
//! [`Pipeline`](crate::pipeline::Pipeline) and handed to each component.
//!
//! Capacity is 1, the smallest bounded channel tokio offers: a caller of
//! `ack`/`nack`/`quarantine` waits whenever the owning component has not yet
//! taken the previous signal, so a slow store write slows the application
//! loop down instead of piling up work in memory.

use tokio::sync::mpsc;

use crate::pipeline::message::Message;

const SIGNAL_CAPACITY: usize = 1;

/// Sending half, cloned into every [`Message`].
#[derive(Debug, Clone)]
pub struct Signals {
    pub(crate) ack: mpsc::Sender<Message>,
    pub(crate) nack: mpsc::Sender<Message>,
    pub(crate) quarantine: mpsc::Sender<Message>,
}

/// Receiving half, split between the components that own each signal.
#[derive(Debug)]
pub struct SignalReceivers {
    pub ack: mpsc::Receiver<Message>,
    pub nack: mpsc::Receiver<Message>,
    pub quarantine: mpsc::Receiver<Message>,
}

pub fn signal_channels() -> (Signals, SignalReceivers) {
    let (ack_tx, ack_rx) = mpsc::channel(SIGNAL_CAPACITY);
    let (nack_tx, nack_rx) = mpsc::channel(SIGNAL_CAPACITY);
    let (quarantine_tx, quarantine_rx) = mpsc::channel(SIGNAL_CAPACITY);
    (
        Signals {
            ack: ack_tx,
            nack: nack_tx,
            quarantine: quarantine_tx,
        },
        SignalReceivers {
            ack: ack_rx,
            nack: nack_rx,
            quarantine: quarantine_rx,
        },
    )
}

//! Channel message types between the front door, output actor and mixer
//! actor, plus the synchronous request helper used for control traffic.

use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::picture::{DecodedPicture, SessionConfig};
use crate::vendor::OutputSurfaceHandle;

/// Reply to a synchronous control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlReply {
    Accepted,
    Error,
}

/// Control-priority messages to the output actor.
pub enum OutputControl {
    Init {
        config: SessionConfig,
        reply: Sender<ControlReply>,
    },
    Flush {
        reply: Sender<ControlReply>,
    },
    /// Releases GPU resources not pinned by outstanding render pictures.
    Precleanup {
        reply: Sender<ControlReply>,
    },
    Stop,
}

/// Asynchronous notifications from the output actor to the front door.
#[derive(Debug, Clone, Copy)]
pub enum OutputEvent {
    /// Unrecoverable failure inside the output or mixer actor.
    Error,
}

/// Data-priority messages to the output actor.
#[derive(Debug)]
pub enum OutputData {
    NewFrame(DecodedPicture),
    /// A render picture came back from the consumer.
    ReturnPic { id: u64, epoch: u64 },
}

/// Control-priority messages to the mixer actor.
pub enum MixerControl {
    Init {
        config: SessionConfig,
        reply: Sender<ControlReply>,
    },
    Flush {
        reply: Sender<ControlReply>,
    },
    /// Hands all queued output surfaces back so the caller can destroy
    /// them.
    ReclaimBuffers {
        reply: Sender<Vec<OutputSurfaceHandle>>,
    },
    Stop,
}

/// Data-priority messages to the mixer actor.
#[derive(Debug)]
pub enum MixerData {
    Frame(DecodedPicture),
    /// An output surface freed up for the mixer to render into.
    Buffer(OutputSurfaceHandle),
}

/// Sends a control message built from a fresh reply channel and waits for
/// the answer. A timeout or a dead peer counts as an error reply.
pub fn request<M>(
    tx: &Sender<M>,
    build: impl FnOnce(Sender<ControlReply>) -> M,
    timeout: Duration,
) -> ControlReply {
    let (reply_tx, reply_rx): (Sender<ControlReply>, Receiver<ControlReply>) = bounded(1);
    if tx.send(build(reply_tx)).is_err() {
        return ControlReply::Error;
    }
    reply_rx.recv_timeout(timeout).unwrap_or(ControlReply::Error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use std::thread;

    #[test]
    fn test_request_round_trip() {
        let (tx, rx) = unbounded::<OutputControl>();
        let worker = thread::spawn(move || {
            if let Ok(OutputControl::Flush { reply }) = rx.recv() {
                let _ = reply.send(ControlReply::Accepted);
            }
        });
        let reply = request(
            &tx,
            |reply| OutputControl::Flush { reply },
            Duration::from_secs(1),
        );
        assert_eq!(reply, ControlReply::Accepted);
        worker.join().unwrap();
    }

    #[test]
    fn test_request_times_out_as_error() {
        let (tx, _rx) = unbounded::<OutputControl>();
        let reply = request(
            &tx,
            |reply| OutputControl::Flush { reply },
            Duration::from_millis(10),
        );
        assert_eq!(reply, ControlReply::Error);
    }

    #[test]
    fn test_request_dead_peer_is_error() {
        let (tx, rx) = unbounded::<OutputControl>();
        drop(rx);
        let reply = request(
            &tx,
            |reply| OutputControl::Flush { reply },
            Duration::from_millis(10),
        );
        assert_eq!(reply, ControlReply::Error);
    }
}

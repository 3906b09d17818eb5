use tokio::{
    select,
    sync::{mpsc, oneshot},
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::metrics::{CheckPayload, Event, ServiceCheck};

/// Events and service checks accumulated since the previous flush.
#[derive(Debug, Default, PartialEq)]
pub struct BufferedPayloads {
    /// Buffered events.
    pub events: Vec<Event>,

    /// Buffered service checks.
    pub service_checks: Vec<ServiceCheck>,
}

impl BufferedPayloads {
    /// Returns `true` if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.service_checks.is_empty()
    }
}

/// Creates the check payload buffer.
///
/// Returns the sender that producers commit payloads through, the handle used at flush time to take the buffered
/// payloads, and the buffer itself, which must be run for either of those to make progress.
pub fn check_payload_buffer(
    queue_size: usize,
) -> (mpsc::Sender<CheckPayload>, CheckPayloadBufferHandle, CheckPayloadBuffer) {
    let (payloads_tx, payloads_rx) = mpsc::channel(queue_size.max(1));
    let (requests_tx, requests_rx) = mpsc::channel(1);

    let buffer = CheckPayloadBuffer {
        payloads: payloads_rx,
        requests: requests_rx,
        buffered: BufferedPayloads::default(),
    };

    (payloads_tx, CheckPayloadBufferHandle { requests: requests_tx }, buffer)
}

/// Handle for taking the buffered payloads.
#[derive(Clone)]
pub struct CheckPayloadBufferHandle {
    requests: mpsc::Sender<oneshot::Sender<BufferedPayloads>>,
}

impl CheckPayloadBufferHandle {
    /// Takes everything buffered so far.
    ///
    /// Payloads committed before this call are included. If the buffer is not running, nothing is returned.
    pub async fn take(&self) -> BufferedPayloads {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.requests.send(reply_tx).await.is_err() {
            return BufferedPayloads::default();
        }
        reply_rx.await.unwrap_or_default()
    }
}

/// Accumulates events and service checks between flushes.
pub struct CheckPayloadBuffer {
    payloads: mpsc::Receiver<CheckPayload>,
    requests: mpsc::Receiver<oneshot::Sender<BufferedPayloads>>,
    buffered: BufferedPayloads,
}

impl CheckPayloadBuffer {
    /// Runs the buffer until `shutdown` is cancelled.
    pub async fn run(mut self, shutdown: CancellationToken) {
        debug!("Check payload buffer started.");

        loop {
            select! {
                // Queued payloads are always absorbed before a take request is served.
                biased;

                _ = shutdown.cancelled() => break,
                Some(payload) = self.payloads.recv() => match payload {
                    CheckPayload::Event(event) => self.buffered.events.push(event),
                    CheckPayload::ServiceCheck(service_check) => self.buffered.service_checks.push(service_check),
                },
                Some(reply_tx) = self.requests.recv() => {
                    let buffered = std::mem::take(&mut self.buffered);
                    if let Err(buffered) = reply_tx.send(buffered) {
                        // Requester went away, so keep the payloads for the next flush.
                        self.buffered = buffered;
                    }
                },
                else => break,
            }
        }

        debug!("Check payload buffer stopped.");
    }
}

//! DogStatsD ingestion.
//!
//! A single listener reads datagrams off a UDP socket and queues them for a pool of workers. Workers split each packet
//! into lines, parse the metric lines, and route the resulting samples into the shards.
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
};

use metrics::{counter, Counter};
use tokio::{
    net::UdpSocket,
    select,
    sync::{mpsc, Mutex},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::{
    error::{ErrorContext as _, GenericError},
    router::SampleRouter,
};

pub mod codec;
use self::codec::{parse_metric_line, split_at_delimiter, ParseError};

/// Listener settings.
#[derive(Clone, Copy, Debug)]
pub struct ListenerSettings {
    /// UDP port to listen on. Zero disables the listener.
    pub port: u16,

    /// Whether to listen on all interfaces rather than only on localhost.
    pub non_local_traffic: bool,

    /// Size of the receive buffer, in bytes. Larger datagrams are truncated.
    pub buffer_size: usize,

    /// Number of packets queued for the workers before the listener stops reading.
    pub queue_size: usize,
}

impl ListenerSettings {
    /// Address to bind to, or `None` if the listener is disabled.
    pub fn listen_address(&self) -> Option<SocketAddr> {
        if self.port == 0 {
            return None;
        }

        let ip = if self.non_local_traffic {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        } else {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        };
        Some(SocketAddr::new(ip, self.port))
    }
}

#[derive(Clone)]
struct Telemetry {
    packets_received: Counter,
    bytes_received: Counter,
    samples_parsed: Counter,
    parse_errors: Counter,
    unsupported_messages: Counter,
}

impl Telemetry {
    fn new() -> Self {
        Self {
            packets_received: counter!("dogstatsd_packets_received_total"),
            bytes_received: counter!("dogstatsd_bytes_received_total"),
            samples_parsed: counter!("dogstatsd_samples_parsed_total"),
            parse_errors: counter!("dogstatsd_parse_errors_total"),
            unsupported_messages: counter!("dogstatsd_unsupported_messages_total"),
        }
    }
}

/// Shared receiving end of the packet queue.
pub type PacketQueue = Arc<Mutex<mpsc::Receiver<Vec<u8>>>>;

/// UDP listener feeding the packet queue.
pub struct DogStatsDListener {
    socket: UdpSocket,
    buffer_size: usize,
    packets: mpsc::Sender<Vec<u8>>,
    telemetry: Telemetry,
}

impl DogStatsDListener {
    /// Binds a listener to `address`, returning it along with the queue its packets are delivered to.
    ///
    /// # Errors
    ///
    /// If the socket cannot be bound, an error is returned.
    pub async fn bind(address: SocketAddr, settings: &ListenerSettings) -> Result<(Self, PacketQueue), GenericError> {
        let socket = UdpSocket::bind(address)
            .await
            .with_error_context(|| format!("Failed to bind DogStatsD listener to {}.", address))?;
        let (packets_tx, packets_rx) = mpsc::channel(settings.queue_size.max(1));

        let listener = Self {
            socket,
            buffer_size: settings.buffer_size.max(1),
            packets: packets_tx,
            telemetry: Telemetry::new(),
        };
        Ok((listener, Arc::new(Mutex::new(packets_rx))))
    }

    /// Address the listener is bound to.
    ///
    /// # Errors
    ///
    /// If the address cannot be determined, an error is returned.
    pub fn local_addr(&self) -> Result<SocketAddr, GenericError> {
        Ok(self.socket.local_addr()?)
    }

    /// Reads datagrams until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        debug!(address = ?self.socket.local_addr().ok(), "DogStatsD listener started.");

        let mut buffer = vec![0; self.buffer_size];
        loop {
            select! {
                _ = shutdown.cancelled() => break,
                result = self.socket.recv_from(&mut buffer) => match result {
                    Ok((len, peer)) => {
                        trace!(len, %peer, "Received packet.");
                        self.telemetry.packets_received.increment(1);
                        self.telemetry.bytes_received.increment(len as u64);

                        if self.packets.send(buffer[..len].to_vec()).await.is_err() {
                            debug!("DogStatsD workers are gone. Stopping listener.");
                            break;
                        }
                    }
                    Err(e) => error!(error = %e, "Failed to receive DogStatsD packet."),
                },
            }
        }

        debug!("DogStatsD listener stopped.");
    }
}

/// Parses packets from `packets` and routes the samples through `router`, until `shutdown` is cancelled or the queue
/// closes.
pub async fn run_worker(worker_id: usize, packets: PacketQueue, router: SampleRouter, shutdown: CancellationToken) {
    debug!(worker_id, "DogStatsD worker started.");

    let telemetry = Telemetry::new();
    let mut samples = Vec::new();

    loop {
        let maybe_packet = {
            let mut packets = packets.lock().await;
            select! {
                _ = shutdown.cancelled() => None,
                maybe_packet = packets.recv() => maybe_packet,
            }
        };
        let Some(packet) = maybe_packet else {
            break;
        };

        let mut remaining = packet.as_slice();
        while let Some((line, tail)) = split_at_delimiter(remaining, b'\n') {
            remaining = tail;

            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if line.is_empty() {
                continue;
            }

            match parse_metric_line(line, &mut samples) {
                Ok(parsed) => telemetry.samples_parsed.increment(parsed as u64),
                Err(ParseError::Unsupported { kind }) => {
                    trace!(worker_id, kind, "Skipping unsupported DogStatsD message.");
                    telemetry.unsupported_messages.increment(1);
                }
                Err(e) => {
                    debug!(worker_id, error = %e, "Failed to parse DogStatsD line.");
                    telemetry.parse_errors.increment(1);
                }
            }
        }

        if !samples.is_empty() {
            router.route_by_context(samples.drain(..)).await;
        }
    }

    debug!(worker_id, "DogStatsD worker stopped.");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        metrics::{MetricSamplePool, MetricType},
        sampler::{shard_channel, ShardMessage},
    };

    #[test]
    fn listen_address() {
        let mut settings = ListenerSettings {
            port: 0,
            non_local_traffic: false,
            buffer_size: 1024,
            queue_size: 8,
        };
        assert_eq!(settings.listen_address(), None);

        settings.port = 8125;
        assert_eq!(settings.listen_address(), Some("127.0.0.1:8125".parse().unwrap()));

        settings.non_local_traffic = true;
        assert_eq!(settings.listen_address(), Some("0.0.0.0:8125".parse().unwrap()));
    }

    #[tokio::test]
    async fn packets_are_parsed_and_routed() {
        let settings = ListenerSettings {
            port: 0,
            non_local_traffic: false,
            buffer_size: 1024,
            queue_size: 8,
        };
        let (listener, packets) = DogStatsDListener::bind("127.0.0.1:0".parse().unwrap(), &settings)
            .await
            .unwrap();
        let address = listener.local_addr().unwrap();

        let (shard, mut shard_rx) = shard_channel(0, 8);
        let (payloads_tx, _payloads_rx) = mpsc::channel(8);
        let router = SampleRouter::new(vec![shard], MetricSamplePool::new(16, 4), payloads_tx);

        let shutdown = CancellationToken::new();
        let listener_task = tokio::spawn(listener.run(shutdown.clone()));
        let worker_task = tokio::spawn(run_worker(0, packets, router, shutdown.clone()));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(b"requests:1|c|#env:prod\nbogus\r\nlatency:5|ms\n_sc|db|0\nlate:2|g|T1700000000", address)
            .await
            .unwrap();

        let mut windowed = Vec::new();
        let mut late = Vec::new();
        while windowed.len() + late.len() < 3 {
            match tokio::time::timeout(Duration::from_secs(5), shard_rx.recv()).await {
                Ok(Some(ShardMessage::Samples(batch))) => windowed.extend(batch.into_inner()),
                Ok(Some(ShardMessage::LateMetrics(batch))) => late.extend(batch.into_inner()),
                _ => panic!("expected samples"),
            }
        }

        assert_eq!(windowed.len(), 2);
        assert!(windowed.iter().any(|sample| sample.metric_type == MetricType::Histogram));
        assert_eq!(late.len(), 1);
        assert_eq!(late[0].timestamp, Some(1_700_000_000));

        shutdown.cancel();
        listener_task.await.unwrap();
        worker_task.await.unwrap();
    }
}

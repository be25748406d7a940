//! Control-plane and data-plane transports
//!
//! ## Control plane
//!
//! Small ordered messages between the launcher and the aggregator. Each side
//! owns one [`ControlEndpoint`]; any task may send through it, but all sends
//! funnel into a single writer so messages keep their send order.
//!
//! ```text
//! launcher tasks ──send──► [ordered queue] ──► peer.recv()
//! ```
//!
//! Endpoints are either an in-memory pair or bridged onto TCP with
//! length-prefixed frames (u32 little-endian length, then the encoded message).
//! A listening endpoint accepts a fresh connection after the peer reboots and
//! keeps handing messages to the same receiver.
//!
//! ## Data plane
//!
//! Many simulations push [`DataMessage`]s to one aggregator. The queue is
//! bounded by a high-water mark; when it is full the message is dropped and
//! counted instead of blocking the producer.

use crate::error::{ProtocolError, Result};
use crate::message::{DataMessage, Message};
use futures::{Stream, StreamExt};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{Mutex, Notify, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// Default data-plane high-water mark (messages)
pub const DEFAULT_HIGH_WATER_MARK: usize = 4096;

/// Data-plane port the aggregator listens on unless told otherwise
pub const DEFAULT_DATA_PORT: u16 = 5556;

/// Control-plane queue depth per direction
const CONTROL_QUEUE_DEPTH: usize = 1024;

/// Upper bound on a single frame, protects against garbage length prefixes
const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

/// One side of the control plane
pub struct ControlEndpoint {
    outbound: mpsc::Sender<Message>,
    inbound: Mutex<mpsc::Receiver<Message>>,
}

impl ControlEndpoint {
    /// Create two connected in-memory endpoints
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::channel(CONTROL_QUEUE_DEPTH);
        let (b_tx, b_rx) = mpsc::channel(CONTROL_QUEUE_DEPTH);
        (
            Self {
                outbound: a_tx,
                inbound: Mutex::new(b_rx),
            },
            Self {
                outbound: b_tx,
                inbound: Mutex::new(a_rx),
            },
        )
    }

    /// Connect to a listening peer over TCP
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;

        let (in_tx, in_rx) = mpsc::channel(CONTROL_QUEUE_DEPTH);
        let (out_tx, out_rx) = mpsc::channel(CONTROL_QUEUE_DEPTH);
        let (_, generation) = watch::channel(0);
        spawn_bridge(stream, in_tx, Arc::new(Outbox::new(out_rx)), generation, 0);

        Ok(Self {
            outbound: out_tx,
            inbound: Mutex::new(in_rx),
        })
    }

    /// Accept peers on `listener`, one at a time.
    ///
    /// Each newly accepted connection replaces the previous one, so a
    /// rebooted aggregator reconnects to the same endpoint. The bridge of the
    /// replaced connection stops even if its socket never sees EOF.
    pub fn listen(listener: TcpListener) -> Self {
        let (in_tx, in_rx) = mpsc::channel(CONTROL_QUEUE_DEPTH);
        let (out_tx, out_rx) = mpsc::channel(CONTROL_QUEUE_DEPTH);
        let outbox = Arc::new(Outbox::new(out_rx));
        let (generation_tx, _) = watch::channel(0u64);

        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        info!(peer = %peer, "Control-plane peer connected");
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(error = %e, "Failed to set TCP_NODELAY");
                        }
                        generation_tx.send_modify(|generation| *generation += 1);
                        let current = *generation_tx.borrow();
                        spawn_bridge(stream, in_tx.clone(), outbox.clone(), generation_tx.subscribe(), current);
                    }
                    Err(e) => {
                        warn!(error = %e, "Control-plane accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
                if in_tx.is_closed() {
                    break;
                }
            }
        });

        Self {
            outbound: out_tx,
            inbound: Mutex::new(in_rx),
        }
    }

    /// Queue a message for the peer
    pub async fn send(&self, message: Message) -> Result<()> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| ProtocolError::Closed)
    }

    /// Wait for the next message. `None` once the peer side is gone.
    pub async fn recv(&self) -> Option<Message> {
        self.inbound.lock().await.recv().await
    }

    /// Wait at most `timeout` for the next message.
    ///
    /// Returns `Ok(None)` on timeout and `Err(Closed)` once the peer is gone.
    pub async fn recv_timeout(&self, timeout: Duration) -> Result<Option<Message>> {
        let mut inbound = self.inbound.lock().await;
        match tokio::time::timeout(timeout, inbound.recv()).await {
            Ok(Some(message)) => Ok(Some(message)),
            Ok(None) => Err(ProtocolError::Closed),
            Err(_) => Ok(None),
        }
    }
}

/// Outbound queue shared by the successive connections of one endpoint
struct Outbox {
    queue: Mutex<mpsc::Receiver<Message>>,
    requeued: Mutex<VecDeque<Message>>,
    requeue_signal: Notify,
}

impl Outbox {
    fn new(queue: mpsc::Receiver<Message>) -> Self {
        Self {
            queue: Mutex::new(queue),
            requeued: Mutex::new(VecDeque::new()),
            requeue_signal: Notify::new(),
        }
    }

    /// Next message to write, requeued ones first. `None` once every sender is gone.
    async fn next(&self) -> Option<Message> {
        let mut queue = self.queue.lock().await;
        loop {
            if let Some(message) = self.requeued.lock().await.pop_front() {
                return Some(message);
            }
            tokio::select! {
                biased;
                _ = self.requeue_signal.notified() => continue,
                message = queue.recv() => return message,
            }
        }
    }

    /// Hand back a message whose write failed so the next connection sends it
    async fn requeue(&self, message: Message) {
        self.requeued.lock().await.push_back(message);
        self.requeue_signal.notify_one();
    }
}

/// Resolves once a newer connection has replaced connection `mine`
async fn superseded(generation: &mut watch::Receiver<u64>, mine: u64) {
    let replaced = generation.wait_for(|current| *current != mine).await.is_ok();
    if !replaced {
        // endpoint without a listener, never replaced
        std::future::pending::<()>().await;
    }
}

fn spawn_bridge(
    stream: TcpStream,
    inbound: mpsc::Sender<Message>,
    outbox: Arc<Outbox>,
    generation: watch::Receiver<u64>,
    mine: u64,
) {
    let (read_half, mut write_half) = stream.into_split();
    let (closed_tx, mut closed_rx) = oneshot::channel::<()>();
    let mut reader_generation = generation.clone();
    let mut writer_generation = generation;

    tokio::spawn(async move {
        let frames = frame_stream(read_half);
        futures::pin_mut!(frames);
        loop {
            let frame = tokio::select! {
                biased;
                _ = superseded(&mut reader_generation, mine) => {
                    debug!(connection = mine, "Control-plane connection replaced");
                    break;
                }
                frame = frames.next() => match frame {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => {
                        warn!(error = %e, "Control-plane read failed");
                        break;
                    }
                    None => break,
                },
            };
            match Message::decode(&frame) {
                Ok(message) => {
                    if inbound.send(message).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "Discarding malformed control-plane message"),
            }
        }
        debug!("Control-plane reader finished");
        let _ = closed_tx.send(());
    });

    tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                biased;
                _ = &mut closed_rx => break,
                _ = superseded(&mut writer_generation, mine) => break,
                message = outbox.next() => match message {
                    Some(message) => message,
                    None => break,
                },
            };
            if let Err(e) = write_frame(&mut write_half, &message.encode()).await {
                warn!(error = %e, kind = message.kind(), "Control-plane write failed, keeping message for the next connection");
                outbox.requeue(message).await;
                break;
            }
        }
        debug!("Control-plane writer finished");
    });
}

/// Write one length-prefixed frame
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    writer.write_u32_le(payload.len() as u32).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read length-prefixed frames until the peer closes the connection
pub fn frame_stream<R>(mut reader: R) -> impl Stream<Item = Result<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    async_stream::stream! {
        loop {
            let len = match reader.read_u32_le().await {
                Ok(len) => len as usize,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => {
                    yield Err(ProtocolError::Io(e));
                    break;
                }
            };
            if len > MAX_FRAME_LEN {
                yield Err(ProtocolError::Truncated { needed: len, remaining: MAX_FRAME_LEN });
                break;
            }
            let mut frame = vec![0u8; len];
            if let Err(e) = reader.read_exact(&mut frame).await {
                yield Err(ProtocolError::Io(e));
                break;
            }
            yield Ok(frame);
        }
    }
}

/// Create a bounded data-plane queue
pub fn data_plane(high_water_mark: usize) -> (DataSender, DataReceiver) {
    let (tx, rx) = mpsc::channel(high_water_mark.max(1));
    (
        DataSender {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        },
        DataReceiver { rx },
    )
}

/// Producer handle of the data plane, cheap to clone
#[derive(Clone)]
pub struct DataSender {
    tx: mpsc::Sender<DataMessage>,
    dropped: Arc<AtomicU64>,
}

impl DataSender {
    /// Enqueue without blocking. Returns `false` when the message was dropped.
    pub fn push(&self, message: DataMessage) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(message)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(
                    simulation_id = %message.simulation_id,
                    timestep = message.timestep,
                    dropped,
                    "Data plane above high-water mark, dropping message"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Messages dropped so far because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Consumer handle of the data plane
pub struct DataReceiver {
    rx: mpsc::Receiver<DataMessage>,
}

impl DataReceiver {
    pub async fn recv(&mut self) -> Option<DataMessage> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SimulationId;

    #[tokio::test]
    async fn test_pair_preserves_order() {
        let (launcher, server) = ControlEndpoint::pair();
        for id in 0..10 {
            launcher
                .send(Message::Timeout {
                    simulation_id: SimulationId(id),
                })
                .await
                .unwrap();
        }
        for id in 0..10 {
            assert_eq!(
                server.recv().await,
                Some(Message::Timeout {
                    simulation_id: SimulationId(id)
                })
            );
        }
    }

    #[tokio::test]
    async fn test_recv_timeout_elapses() {
        let (_launcher, server) = ControlEndpoint::pair();
        let received = tokio_test::assert_ok!(server.recv_timeout(Duration::from_millis(10)).await);
        assert!(received.is_none());
    }

    #[tokio::test]
    async fn test_recv_timeout_reports_closed_peer() {
        let (launcher, server) = ControlEndpoint::pair();
        drop(launcher);
        let received = server.recv_timeout(Duration::from_millis(10)).await;
        assert!(matches!(received, Err(ProtocolError::Closed)));
    }

    #[tokio::test]
    async fn test_data_plane_drops_above_high_water_mark() {
        let (sender, mut receiver) = data_plane(2);
        let message = DataMessage::new(SimulationId(1), "u", 0, vec![1.0]);

        assert!(sender.push(message.clone()));
        assert!(sender.push(message.clone()));
        assert!(!sender.push(message.clone()));
        assert_eq!(sender.dropped(), 1);

        assert_eq!(receiver.recv().await, Some(message));
    }

    #[tokio::test]
    async fn test_tcp_bridge_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let launcher = ControlEndpoint::listen(listener);
        let server = ControlEndpoint::connect(addr).await.unwrap();

        server
            .send(Message::Server {
                rank: 0,
                node_name: "node042".into(),
            })
            .await
            .unwrap();
        let received = launcher.recv_timeout(Duration::from_secs(5)).await.unwrap();
        assert_eq!(
            received,
            Some(Message::Server {
                rank: 0,
                node_name: "node042".into()
            })
        );

        launcher.send(Message::Stop).await.unwrap();
        let received = server.recv_timeout(Duration::from_secs(5)).await.unwrap();
        assert_eq!(received, Some(Message::Stop));
    }

    #[tokio::test]
    async fn test_new_peer_replaces_silent_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let launcher = ControlEndpoint::listen(listener);

        // Stays open without ever closing, like a peer on a dead node
        let _stale = TcpStream::connect(addr).await.unwrap();
        let rebooted = ControlEndpoint::connect(addr).await.unwrap();
        rebooted
            .send(Message::Server {
                rank: 0,
                node_name: "node007".into(),
            })
            .await
            .unwrap();
        let hello = launcher.recv_timeout(Duration::from_secs(5)).await.unwrap();
        assert!(matches!(hello, Some(Message::Server { .. })));

        launcher.send(Message::Stop).await.unwrap();
        let received = rebooted.recv_timeout(Duration::from_secs(5)).await.unwrap();
        assert_eq!(received, Some(Message::Stop));
    }

    #[tokio::test]
    async fn test_requeued_message_goes_out_first() {
        let (tx, rx) = mpsc::channel(4);
        let outbox = Outbox::new(rx);
        tx.send(Message::Stop).await.unwrap();
        outbox
            .requeue(Message::Timeout {
                simulation_id: SimulationId(4),
            })
            .await;

        assert_eq!(
            outbox.next().await,
            Some(Message::Timeout {
                simulation_id: SimulationId(4)
            })
        );
        assert_eq!(outbox.next().await, Some(Message::Stop));
    }

    #[tokio::test]
    async fn test_frame_stream_ends_on_eof() {
        let (mut client, server) = tokio::io::duplex(64);
        write_frame(&mut client, &[1, 2, 3]).await.unwrap();
        drop(client);

        let frames: Vec<_> = frame_stream(server).collect().await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_ref().unwrap(), &vec![1, 2, 3]);
    }
}

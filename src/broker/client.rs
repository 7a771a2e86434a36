//! TCP client for a remote broker
//!
//! Used by the central forwarder to reach the platform's broker. One
//! connection, a writer queue, and a reader task that dispatches `MSG`
//! frames to per-sid subscriptions and answers server pings. Connection
//! loss is surfaced through a `watch` channel; reconnection policy belongs
//! to the caller.

use super::{proto, Message};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use super::BrokerError;

const WRITE_QUEUE_DEPTH: usize = 256;
const SUBSCRIPTION_DEPTH: usize = 64;

/// Remote payloads above this are refused before hitting the wire.
const MAX_REMOTE_PAYLOAD: usize = 8 * 1024 * 1024;

type SubMap = Arc<Mutex<HashMap<u64, mpsc::Sender<Message>>>>;

pub struct BrokerClient {
    write_tx: mpsc::Sender<Vec<u8>>,
    subs: SubMap,
    next_sid: AtomicU64,
    connected_rx: watch::Receiver<bool>,
    reader_task: tokio::task::JoinHandle<()>,
}

impl BrokerClient {
    /// Connects and identifies as `name`. Returns once the CONNECT frame
    /// has been queued; the server's INFO is consumed by the reader task.
    pub async fn connect(addr: &str, name: &str) -> Result<Self, BrokerError> {
        let socket = TcpStream::connect(addr).await?;
        socket.set_nodelay(true)?;
        let (read_half, mut write_half) = socket.into_split();

        let connect = json!({ "name": name, "verbose": false });
        write_half
            .write_all(&proto::encode_connect(&connect))
            .await?;

        let (write_tx, mut write_rx) = mpsc::channel::<Vec<u8>>(WRITE_QUEUE_DEPTH);
        let (connected_tx, connected_rx) = watch::channel(true);

        tokio::spawn(async move {
            while let Some(frame) = write_rx.recv().await {
                if write_half.write_all(&frame).await.is_err() {
                    break;
                }
            }
            let _ = write_half.shutdown().await;
        });

        let subs: SubMap = Arc::new(Mutex::new(HashMap::new()));
        let reader_subs = Arc::clone(&subs);
        let pong_tx = write_tx.clone();
        let reader_task = tokio::spawn(async move {
            let mut reader = BufReader::new(read_half);
            loop {
                match proto::read_op(&mut reader, MAX_REMOTE_PAYLOAD).await {
                    Ok(Some(proto::Op::Msg { subject, sid, payload })) => {
                        let tx = reader_subs.lock().get(&sid).cloned();
                        if let Some(tx) = tx {
                            // Same drop policy as the embedded broker.
                            let _ = tx.try_send(Message { subject, payload });
                        }
                    }
                    Ok(Some(proto::Op::Ping)) => {
                        let _ = pong_tx.try_send(proto::PONG.to_vec());
                    }
                    Ok(Some(proto::Op::Info(_)))
                    | Ok(Some(proto::Op::Pong)) => {}
                    Ok(Some(proto::Op::Err(msg))) => {
                        warn!(error = %msg, "Remote broker error");
                    }
                    Ok(Some(other)) => {
                        debug!(op = ?other, "Ignoring unexpected op from remote broker");
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!(error = %e, "Remote broker read failed");
                        break;
                    }
                }
            }
            let _ = connected_tx.send(false);
        });

        Ok(Self {
            write_tx,
            subs,
            next_sid: AtomicU64::new(1),
            connected_rx,
            reader_task,
        })
    }

    /// Watch handle that flips to `false` when the connection dies.
    pub fn connected(&self) -> watch::Receiver<bool> {
        self.connected_rx.clone()
    }

    pub fn is_connected(&self) -> bool {
        *self.connected_rx.borrow()
    }

    /// Queues a publish. Fails once the connection is gone.
    pub async fn publish(&self, subject: &str, payload: &[u8]) -> Result<(), BrokerError> {
        if payload.len() > MAX_REMOTE_PAYLOAD {
            return Err(BrokerError::PayloadTooLarge(payload.len(), MAX_REMOTE_PAYLOAD));
        }
        self.write_tx
            .send(proto::encode_pub(subject, payload))
            .await
            .map_err(|_| BrokerError::Closed)
    }

    /// Subscribes to `pattern` on the remote broker.
    pub async fn subscribe(&self, pattern: &str) -> Result<ClientSubscription, BrokerError> {
        let sid = self.next_sid.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_DEPTH);
        self.subs.lock().insert(sid, tx);

        if let Err(e) = self
            .write_tx
            .send(proto::encode_sub(pattern, sid))
            .await
            .map_err(|_| BrokerError::Closed)
        {
            self.subs.lock().remove(&sid);
            return Err(e);
        }

        Ok(ClientSubscription {
            sid,
            rx,
            subs: Arc::clone(&self.subs),
            write_tx: self.write_tx.clone(),
        })
    }
}

impl Drop for BrokerClient {
    fn drop(&mut self) {
        // The reader holds a writer handle for pong replies; aborting it
        // lets the writer drain and close the socket.
        self.reader_task.abort();
    }
}

/// Receiving half of a remote subscription. Unsubscribes on drop.
pub struct ClientSubscription {
    sid: u64,
    rx: mpsc::Receiver<Message>,
    subs: SubMap,
    write_tx: mpsc::Sender<Vec<u8>>,
}

impl ClientSubscription {
    pub async fn next(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

impl Drop for ClientSubscription {
    fn drop(&mut self) {
        self.subs.lock().remove(&self.sid);
        let _ = self.write_tx.try_send(proto::encode_unsub(self.sid));
    }
}

//! TCP front end for the embedded broker
//!
//! Listens on the loopback interface so analytics workers running as
//! separate processes can subscribe to frames and publish detections and
//! events. Each connection gets a reader task (parsing client operations)
//! and a writer task (serialising outbound frames); per-subscription
//! forwarders bridge the in-process tables onto the wire.

use super::{proto, Broker, Subscription};
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Outbound frames queued per connection before the writer applies the
/// slow-consumer drop policy.
const WRITE_QUEUE_DEPTH: usize = 128;

pub struct BrokerServer {
    broker: Broker,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl BrokerServer {
    /// Binds the listener. Loopback by convention; the port is the node's
    /// local broker port (default 4222).
    pub async fn bind(broker: Broker, addr: &str) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Local broker listening");
        Ok(Self {
            broker,
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept loop. Runs until `shutdown` flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("Local broker shutting down");
                    break;
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((socket, addr)) => {
                            debug!(client = %addr, "Broker client connected");
                            let broker = self.broker.clone();
                            let shutdown = shutdown.clone();
                            tokio::spawn(async move {
                                broker.client_connected();
                                if let Err(e) = handle_connection(socket, &broker, shutdown).await {
                                    debug!(client = %addr, error = %e, "Broker client closed");
                                }
                                broker.client_disconnected();
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Broker accept error");
                        }
                    }
                }
            }
        }
    }
}

async fn handle_connection(
    socket: TcpStream,
    broker: &Broker,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = socket.into_split();
    let mut reader = BufReader::new(read_half);

    let info = json!({
        "server": "magicbox",
        "version": env!("CARGO_PKG_VERSION"),
        "max_payload": broker.max_payload(),
    });
    write_half.write_all(&proto::encode_info(&info)).await?;

    // Writer task: one queue per connection, drop-on-full like the
    // in-process subscriptions.
    let (write_tx, mut write_rx) = mpsc::channel::<Vec<u8>>(WRITE_QUEUE_DEPTH);
    let writer: JoinHandle<()> = tokio::spawn(async move {
        while let Some(frame) = write_rx.recv().await {
            if write_half.write_all(&frame).await.is_err() {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    // Per-client subscription forwarders, keyed by the client's sid.
    let mut forwarders: HashMap<u64, JoinHandle<()>> = HashMap::new();

    let result = loop {
        let op = tokio::select! {
            _ = shutdown.changed() => break Ok(()),
            op = proto::read_op(&mut reader, broker.max_payload()) => op,
        };
        let op = match op {
            Ok(Some(op)) => op,
            Ok(None) => break Ok(()),
            Err(e) => {
                let _ = write_tx.try_send(proto::encode_err(&e.to_string()));
                break Err(e);
            }
        };

        match op {
            proto::Op::Connect(_) => {}
            proto::Op::Ping => {
                let _ = write_tx.try_send(proto::PONG.to_vec());
            }
            proto::Op::Pong => {}
            proto::Op::Pub { subject, payload } => {
                if let Err(e) = broker.publish(&subject, payload) {
                    warn!(subject = %subject, error = %e, "Rejected publish");
                    let _ = write_tx.try_send(proto::encode_err(&e.to_string()));
                }
            }
            proto::Op::Sub { subject, sid } => match broker.subscribe(&subject) {
                Ok(sub) => {
                    let tx = write_tx.clone();
                    if let Some(stale) = forwarders.insert(sid, tokio::spawn(forward(sub, sid, tx))) {
                        stale.abort();
                    }
                }
                Err(e) => {
                    let _ = write_tx.try_send(proto::encode_err(&e.to_string()));
                }
            },
            proto::Op::Unsub { sid } => {
                if let Some(task) = forwarders.remove(&sid) {
                    task.abort();
                }
            }
            proto::Op::Msg { .. } | proto::Op::Info(_) | proto::Op::Err(_) => {
                // Server-side verbs are not valid from a client.
                let _ = write_tx.try_send(proto::encode_err("unexpected op"));
            }
        }
    };

    for (_, task) in forwarders {
        task.abort();
    }
    drop(write_tx);
    let _ = writer.await;
    result
}

/// Bridges one in-process subscription onto the connection's write queue.
/// Dropping the task drops the subscription and detaches it from the
/// broker tables.
async fn forward(mut sub: Subscription, sid: u64, tx: mpsc::Sender<Vec<u8>>) {
    while let Some(msg) = sub.next().await {
        let frame = proto::encode_msg(&msg.subject, sid, &msg.payload);
        if tx.try_send(frame).is_err() {
            if tx.is_closed() {
                break;
            }
            // Connection writer saturated: drop, same policy as in-process.
        }
    }
}

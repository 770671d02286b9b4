//! A single data node's persistent session: the write half plus the
//! demultiplexing waiter tables described in `spec.md` §4.4's concurrency
//! note and §9's "multiplexed per-node inbound stream" design note.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex as StdMutex;

use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tracing::debug;

use crate::wire::codec::CodecError;
use crate::wire::message::NodeInbound;

/// Live session for one joined data node.
///
/// Holds the write half of the node's TCP connection (serialized behind a
/// mutex so concurrent fan-out legs never interleave sub-line writes) and a
/// set of waiter tables that the node's dedicated reader task consults to
/// route each inbound line to whichever coordinator call is waiting on it.
#[derive(Debug)]
pub struct NodeSession {
    port: u16,
    writer: AsyncMutex<OwnedWriteHalf>,
    file_count: AtomicI64,
    store_ack_waiters: DashMap<String, oneshot::Sender<()>>,
    /// `true` payload means the node sent `REMOVE_ACK` (decrement
    /// `file_count`); `false` means it sent `ERROR_FILE_DOES_NOT_EXIST`,
    /// still accepted as a successful ack per `spec.md` §4.4.
    remove_ack_waiters: DashMap<String, oneshot::Sender<bool>>,
    list_waiter: StdMutex<Option<oneshot::Sender<Vec<String>>>>,
    rebalance_waiter: StdMutex<Option<oneshot::Sender<()>>>,
}

impl NodeSession {
    #[must_use]
    pub fn new(port: u16, writer: OwnedWriteHalf) -> Self {
        Self {
            port,
            writer: AsyncMutex::new(writer),
            file_count: AtomicI64::new(0),
            store_ack_waiters: DashMap::new(),
            remove_ack_waiters: DashMap::new(),
            list_waiter: StdMutex::new(None),
            rebalance_waiter: StdMutex::new(None),
        }
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub fn file_count(&self) -> i64 {
        self.file_count.load(Ordering::SeqCst)
    }

    pub fn adjust_count(&self, delta: i64) {
        self.file_count.fetch_add(delta, Ordering::SeqCst);
    }

    pub fn set_count(&self, value: i64) {
        self.file_count.store(value, Ordering::SeqCst);
    }

    /// Sends one line to this node. Failure marks the session broken; the
    /// caller should let the node's reader task observe the close and
    /// evict it.
    pub async fn send_line(&self, line: &str) -> Result<(), CodecError> {
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await.map_err(|_| CodecError::Closed)?;
        writer.write_all(b"\n").await.map_err(|_| CodecError::Closed)?;
        writer.flush().await.map_err(|_| CodecError::Closed)
    }

    /// Registers interest in this node's `STORE_ACK` for `name`.
    pub fn register_store_ack(&self, name: &str) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.store_ack_waiters.insert(name.to_string(), tx);
        rx
    }

    /// Registers interest in this node's `REMOVE_ACK`/`ERROR_FILE_DOES_NOT_EXIST`
    /// for `name`.
    pub fn register_remove_ack(&self, name: &str) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        self.remove_ack_waiters.insert(name.to_string(), tx);
        rx
    }

    /// Registers interest in this node's next `LIST` reply.
    pub fn register_list(&self) -> oneshot::Receiver<Vec<String>> {
        let (tx, rx) = oneshot::channel();
        *self.list_waiter.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
        rx
    }

    /// Registers interest in this node's next `REBALANCE_COMPLETE`.
    pub fn register_rebalance_complete(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        *self.rebalance_waiter.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
        rx
    }

    /// Routes one inbound line from this node's reader task to whichever
    /// waiter declared interest in its token. Stray or unmatched replies
    /// (for example, an ack that arrived after its deadline already
    /// elapsed) are logged and dropped.
    pub fn dispatch_inbound(&self, line: &str) -> Result<(), crate::wire::message::ParseError> {
        let msg = NodeInbound::parse(line)?;
        match msg {
            NodeInbound::Join(_) => {
                debug!(port = self.port, "ignoring re-JOIN on an established node session");
            }
            NodeInbound::ListReply(files) => {
                if let Some(tx) = self.list_waiter.lock().unwrap_or_else(|e| e.into_inner()).take() {
                    let _ = tx.send(files);
                } else {
                    debug!(port = self.port, "no waiter for LIST reply, dropping");
                }
            }
            NodeInbound::StoreAck(name) => {
                // Every received ack increments file_count, per `spec.md`
                // §4.4 step 5, whether or not the barrier it's part of
                // ultimately meets its deadline.
                self.adjust_count(1);
                if let Some((_, tx)) = self.store_ack_waiters.remove(&name) {
                    let _ = tx.send(());
                } else {
                    debug!(port = self.port, file = %name, "no waiter for STORE_ACK, dropping");
                }
            }
            NodeInbound::RemoveAck(name) => {
                self.adjust_count(-1);
                if let Some((_, tx)) = self.remove_ack_waiters.remove(&name) {
                    let _ = tx.send(true);
                } else {
                    debug!(port = self.port, file = %name, "no waiter for REMOVE_ACK, dropping");
                }
            }
            NodeInbound::RemoveNotFound(name) => {
                if let Some((_, tx)) = self.remove_ack_waiters.remove(&name) {
                    let _ = tx.send(false);
                } else {
                    debug!(port = self.port, file = %name, "no waiter for REMOVE error-ack, dropping");
                }
            }
            NodeInbound::RebalanceComplete => {
                if let Some(tx) = self
                    .rebalance_waiter
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .take()
                {
                    let _ = tx.send(());
                } else {
                    debug!(port = self.port, "no waiter for REBALANCE_COMPLETE, dropping");
                }
            }
        }
        Ok(())
    }
}

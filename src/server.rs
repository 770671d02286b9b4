//! Ties the wire codec, file index, node registry, gate, coordinator, and
//! rebalance executor together into a running controller process.
//!
//! One [`Controller`] is shared (via `Arc`) across every task it spawns: the
//! accept loop, one task per client connection, one persistent demultiplexer
//! task per joined data node, and the periodic rebalance task.

use std::sync::Arc;

use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::coordinator::{self, ClientState};
use crate::gate::Gate;
use crate::index::FileIndex;
use crate::rebalance;
use crate::registry::{NodeRegistry, NodeSession};
use crate::wire::codec::{self, CodecError};
use crate::wire::message::ClientRequest;

/// The controller's shared coordination state and entry point.
#[derive(Debug)]
pub struct Controller {
    pub config: Config,
    pub index: FileIndex,
    pub registry: NodeRegistry,
    pub gate: Gate,
    rebalance_notify: Notify,
}

impl Controller {
    #[must_use]
    pub fn new(config: Config) -> Arc<Self> {
        Arc::new(Self {
            config,
            index: FileIndex::new(),
            registry: NodeRegistry::new(),
            gate: Gate::new(),
            rebalance_notify: Notify::new(),
        })
    }

    /// Wakes the periodic rebalance task immediately, used after a `JOIN`
    /// per `spec.md` §4.5 ("fires ... also immediately after any `JOIN`").
    pub fn trigger_rebalance(&self) {
        self.rebalance_notify.notify_one();
    }

    /// Binds `cport` and serves client and data-node connections until the
    /// process is killed. Also spawns the periodic rebalance task.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.config.cport)).await?;
        info!(port = self.config.cport, "controller listening");

        tokio::spawn(Arc::clone(&self).rebalance_loop());

        loop {
            let (stream, addr) = listener.accept().await?;
            let controller = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(err) = controller.handle_connection(stream).await {
                    debug!(%addr, error = %err, "connection ended");
                }
            });
        }
    }

    /// Drives the periodic rebalance pass, also woken early by
    /// [`Self::trigger_rebalance`]. At most one pass runs at a time: a
    /// wakeup that lands while a pass is already running (e.g. the period
    /// elapsing right after a `JOIN`-triggered pass starts) is naturally
    /// absorbed, since `run_once` itself holds the gate's exclusive guard
    /// for its whole duration and the next loop iteration simply starts
    /// after it returns.
    async fn rebalance_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.rebalance_period());
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {},
                () = self.rebalance_notify.notified() => {},
            }
            rebalance::run_once(&self).await;
        }
    }

    /// Reads the first line of a new connection to decide whether it's a
    /// data node (`JOIN port`) or a client, then hands off to the matching
    /// session loop.
    async fn handle_connection(self: Arc<Self>, stream: TcpStream) -> Result<(), CodecError> {
        stream.set_nodelay(true).ok();
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let first_line = codec::read_line(&mut reader).await?;
        let tokens: Vec<&str> = first_line.split_whitespace().collect();

        if tokens.first() != Some(&"JOIN") {
            return self.handle_client_session(first_line, reader, write_half).await;
        }

        let port = match tokens.as_slice() {
            ["JOIN", port_token] => port_token.parse::<u16>().ok(),
            _ => None,
        };

        match port {
            Some(port) => self.handle_node_session(port, reader, write_half).await,
            None => warn!(line = %first_line, "malformed JOIN, closing session"),
        }
        Ok(())
    }

    /// The persistent demultiplexer loop for one joined data node:
    /// `spec.md` §4.4's `JOIN` handling and §9's "one reader per node"
    /// design note. Runs until the node's socket closes, then evicts it.
    async fn handle_node_session(
        self: Arc<Self>,
        port: u16,
        mut reader: BufReader<OwnedReadHalf>,
        write_half: OwnedWriteHalf,
    ) {
        let session = Arc::new(NodeSession::new(port, write_half));
        self.registry.join(port, Arc::clone(&session));
        info!(port, "data node joined");
        self.trigger_rebalance();

        loop {
            match codec::read_line(&mut reader).await {
                Ok(line) => {
                    if let Err(err) = session.dispatch_inbound(&line) {
                        warn!(port, error = %err, "malformed message from node, discarding");
                    }
                }
                Err(_closed) => break,
            }
        }

        self.evict_node(port);
    }

    /// Removes a node from the registry and scrubs it from every file's
    /// replica set: `spec.md` §4.3's node lifecycle and §7's transport
    /// failure handling.
    fn evict_node(&self, port: u16) {
        self.registry.remove(port);
        self.index.scrub(port);
        warn!(port, "data node evicted");
    }

    /// The client command loop: parses one line at a time, holds the gate's
    /// client guard for the duration of each command (pausing behind any
    /// concurrently running rebalance pass), and dispatches to
    /// [`coordinator::handle`].
    async fn handle_client_session(
        self: Arc<Self>,
        first_line: String,
        mut reader: BufReader<OwnedReadHalf>,
        mut writer: OwnedWriteHalf,
    ) -> Result<(), CodecError> {
        let mut state = ClientState::default();
        let mut line = first_line;

        loop {
            match ClientRequest::parse(&line) {
                Ok(request) => {
                    let _client_guard = self.gate.client_guard().await;
                    coordinator::handle(&self, &mut state, request, &mut writer).await?;
                }
                Err(err) => {
                    warn!(line = %line, error = %err, "malformed client message, discarding");
                }
            }
            line = codec::read_line(&mut reader).await?;
        }
    }
}

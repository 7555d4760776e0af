//! The mailbox: this island's inbound side of migration.
//!
//! One listening socket, one accepted connection per declared source, and one
//! fixed-capacity ring buffer per subpopulation. Writes from all sources go
//! through a single coarse lock spanning every ring, so the post-breeding
//! drain always sees one consistent snapshot across subpopulations.
//!
//! The rings are lossy by design: once full, each new write overwrites the
//! oldest unread migrant. Bounded memory wins over completeness here, and
//! senders are never backpressured.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use archipelago_protocol::codec::{decode_batch, Codec};
use archipelago_protocol::wire::{self, Compression};
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

/// Fixed-capacity circular buffer with overwrite-oldest overflow.
///
/// Invariant: `0 <= count <= capacity` at every observation point.
#[derive(Debug)]
pub struct RingBuffer<I> {
    slots: Vec<Option<I>>,
    head: usize,
    count: usize,
}

impl<I> RingBuffer<I> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be positive");
        RingBuffer {
            slots: (0..capacity).map(|_| None).collect(),
            head: 0,
            count: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Write one migrant. Saturates at capacity, overwriting the oldest
    /// unread slot once full.
    pub fn push(&mut self, individual: I) {
        let capacity = self.slots.len();
        self.slots[self.head] = Some(individual);
        self.head = (self.head + 1) % capacity;
        if self.count < capacity {
            self.count += 1;
        }
    }

    /// Take every buffered migrant, oldest first, and reset the count.
    pub fn drain(&mut self) -> Vec<I> {
        let capacity = self.slots.len();
        let start = (self.head + capacity - self.count) % capacity;
        let mut out = Vec::with_capacity(self.count);
        for i in 0..self.count {
            if let Some(individual) = self.slots[(start + i) % capacity].take() {
                out.push(individual);
            }
        }
        self.count = 0;
        out
    }
}

/// Inbound migrant receiver for one island.
pub struct Mailbox<I> {
    rings: Arc<Mutex<Vec<RingBuffer<I>>>>,
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    receiver: JoinHandle<()>,
}

impl<I: Send + 'static> Mailbox<I> {
    /// Bind the listening socket and start the receiver task. It accepts
    /// exactly `n_incoming` connections, handshakes each (mailbox writes its
    /// id first), then buffers incoming migration frames until shutdown.
    pub async fn start(
        own_id: String,
        num_subpops: usize,
        capacity: usize,
        n_incoming: usize,
        port: u16,
        compression: Compression,
        codec: Arc<dyn Codec<I>>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .context("binding mailbox listener")?;
        let local_addr = listener.local_addr().context("resolving mailbox address")?;
        let rings = Arc::new(Mutex::new(
            (0..num_subpops)
                .map(|_| RingBuffer::new(capacity))
                .collect::<Vec<_>>(),
        ));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let receiver = tokio::spawn(accept_loop(
            own_id,
            listener,
            n_incoming,
            rings.clone(),
            shutdown_rx,
            compression,
            codec,
        ));
        Ok(Mailbox { rings, local_addr, shutdown, receiver })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The one lock guarding every ring. Held by the receiver per incoming
    /// frame and by the caller for the whole post-breeding drain.
    pub fn lock(&self) -> MutexGuard<'_, Vec<RingBuffer<I>>> {
        self.rings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Buffered migrant counts per subpopulation.
    pub fn counts(&self) -> Vec<usize> {
        self.lock().iter().map(RingBuffer::count).collect()
    }

    /// Cooperative shutdown: flag the receiver, wait for it to close the
    /// listening socket and every inbound connection.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.receiver.await;
    }
}

async fn accept_loop<I: Send + 'static>(
    own_id: String,
    listener: TcpListener,
    n_incoming: usize,
    rings: Arc<Mutex<Vec<RingBuffer<I>>>>,
    mut shutdown: watch::Receiver<bool>,
    compression: Compression,
    codec: Arc<dyn Codec<I>>,
) {
    let mut readers = JoinSet::new();
    let mut accepted = 0usize;
    while accepted < n_incoming {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            result = listener.accept() => match result {
                Ok((mut stream, peer)) => {
                    match wire::handshake_inbound(&mut stream, &own_id).await {
                        Ok(source) => {
                            tracing::debug!(source = %source, addr = %peer, "mailbox link accepted");
                            accepted += 1;
                            readers.spawn(source_loop(
                                source,
                                stream,
                                rings.clone(),
                                shutdown.clone(),
                                compression,
                                codec.clone(),
                            ));
                        }
                        Err(e) => {
                            tracing::warn!(addr = %peer, error = %e, "mailbox handshake failed");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "mailbox accept failed");
                }
            }
        }
    }
    // All expected sources are connected (or we are shutting down); stop
    // listening and let the per-source readers run out.
    drop(listener);
    while readers.join_next().await.is_some() {}
}

/// Read migration frames from one source until it closes, errors, or the
/// mailbox shuts down. Errors mark this source dead; the others continue.
async fn source_loop<I: Send + 'static>(
    source: String,
    stream: TcpStream,
    rings: Arc<Mutex<Vec<RingBuffer<I>>>>,
    mut shutdown: watch::Receiver<bool>,
    compression: Compression,
    codec: Arc<dyn Codec<I>>,
) {
    let mut stream = BufReader::new(stream);
    loop {
        // The frame header read doubles as the idle point; shutdown is only
        // honored between frames, never mid-frame.
        let subpop = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
                continue;
            }
            header = wire::read_i32(&mut stream) => match header {
                Ok(value) => value,
                Err(e) => {
                    tracing::debug!(source = %source, error = %e, "migrant source closed");
                    return;
                }
            }
        };

        let (count, payload) = match wire::read_frame_body(&mut stream, compression).await {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(source = %source, error = %e, "💀 bad frame — dropping migrant source");
                return;
            }
        };
        let individuals = match decode_batch(codec.as_ref(), count, &payload) {
            Ok(individuals) => individuals,
            Err(e) => {
                tracing::warn!(source = %source, error = %e, "💀 undecodable batch — dropping migrant source");
                return;
            }
        };

        let mut rings = rings.lock().unwrap_or_else(PoisonError::into_inner);
        let Ok(index) = usize::try_from(subpop) else {
            tracing::warn!(source = %source, subpop, "negative subpopulation index — dropping migrant source");
            return;
        };
        let Some(ring) = rings.get_mut(index) else {
            tracing::warn!(source = %source, subpop = index, "unknown subpopulation index — dropping migrant source");
            return;
        };
        let arrived = individuals.len();
        for individual in individuals {
            ring.push(individual);
        }
        tracing::trace!(source = %source, subpop = index, arrived, buffered = ring.count(), "migrants buffered");
    }
}

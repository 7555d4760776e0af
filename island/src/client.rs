//! The exchange client: one per island, embedded in the host evolutionary
//! loop.
//!
//! The host calls four hooks — [`ExchangeClient::pre_breeding_exchange`],
//! [`ExchangeClient::post_breeding_exchange`],
//! [`ExchangeClient::run_complete`] and [`ExchangeClient::close_contacts`] —
//! and this module does everything else: registering with the rendezvous
//! server, running the mailbox, dialing destination mailboxes, sending
//! emigrants, assimilating immigrants, and watching for the end of the run.
//!
//! Post-RUN peer failures are absorbed, never propagated: a dead destination
//! is skipped for the rest of the run, and a lost server connection turns
//! into a termination reason the host sees on its next `run_complete` call.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use archipelago_protocol::codec::{encode_batch, Codec};
use archipelago_protocol::wire::{self, ControlToken};
use archipelago_protocol::{Population, Slot};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::IslandConfig;
use crate::mailbox::Mailbox;
use crate::select::SelectionPolicy;

/// Run over because this island found the ideal individual.
pub const REASON_FOUND_LOCALLY: &str = "ideal individual found on this island";
/// Run over because the server relayed another island's find.
pub const REASON_GOODBYE: &str = "server said goodbye";
/// Run over because the server connection is gone.
pub const REASON_SERVER_LOST: &str = "lost contact with the rendezvous server";

/// Exchange schedule handed down by the server at registration.
#[derive(Debug, Clone, Copy)]
pub struct ExchangeParams {
    /// Whether every exchange generation ends at a server barrier.
    pub synchronous: bool,
    /// Exchange every `modulo` generations; 0 means every generation.
    pub modulo: u32,
    /// First generation that exchanges.
    pub offset: u32,
    /// Emigrants sent per destination per subpopulation.
    pub size: usize,
}

impl ExchangeParams {
    pub fn is_exchange_generation(&self, generation: u64) -> bool {
        let offset = u64::from(self.offset);
        if generation < offset {
            return false;
        }
        self.modulo == 0 || (generation - offset) % u64::from(self.modulo) == 0
    }
}

/// What the server-link reader saw on the control connection.
#[derive(Debug, Clone, Copy)]
enum ServerEvent {
    Okay,
    Goodbye,
    Closed,
}

/// The control connection to the rendezvous server after RUN: we keep the
/// write half, a reader task owns the read half and forwards tokens.
struct ServerLink {
    writer: OwnedWriteHalf,
    events: mpsc::Receiver<ServerEvent>,
    reader: JoinHandle<()>,
}

/// One destination mailbox. `conn` is `None` once the destination is known
/// dead; it stays dead for the rest of the run.
struct Destination {
    id: String,
    addr: String,
    conn: Option<TcpStream>,
}

pub struct ExchangeClient<I> {
    config: IslandConfig,
    codec: Arc<dyn Codec<I>>,
    emigrant: Box<dyn SelectionPolicy<I>>,
    eviction: Box<dyn SelectionPolicy<I>>,
    rng: StdRng,
    params: Option<ExchangeParams>,
    link: Option<ServerLink>,
    mailbox: Option<Mailbox<I>>,
    destinations: Vec<Destination>,
    termination: Option<String>,
    embedded_server: Option<JoinHandle<Result<()>>>,
}

impl<I: Send + 'static> ExchangeClient<I> {
    pub fn new(
        config: IslandConfig,
        codec: Arc<dyn Codec<I>>,
        emigrant: Box<dyn SelectionPolicy<I>>,
        eviction: Box<dyn SelectionPolicy<I>>,
    ) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        ExchangeClient {
            config,
            codec,
            emigrant,
            eviction,
            rng,
            params: None,
            link: None,
            mailbox: None,
            destinations: Vec::new(),
            termination: None,
            embedded_server: None,
        }
    }

    /// Register an embedded rendezvous server task so that
    /// [`ExchangeClient::close_contacts`] can wind it down with the rest.
    pub fn attach_server(&mut self, handle: JoinHandle<Result<()>>) {
        self.embedded_server = Some(handle);
    }

    /// Destinations still accepting emigrants.
    pub fn live_destinations(&self) -> usize {
        self.destinations.iter().filter(|d| d.conn.is_some()).count()
    }

    /// Buffered immigrant counts per subpopulation; empty before
    /// initialization.
    pub fn mailbox_counts(&self) -> Vec<usize> {
        self.mailbox.as_ref().map(Mailbox::counts).unwrap_or_default()
    }

    /// Full startup sequence: register with the server (retrying until it is
    /// reachable), start the mailbox, receive exchange parameters and the
    /// destination list, dial every destination mailbox, acknowledge, and
    /// wait for the RUN signal. Pre-RUN protocol violations are fatal.
    pub async fn initialize_contacts(&mut self, num_subpops: usize) -> Result<()> {
        self.termination = None;

        let mut stream = self.connect_server().await;
        wire::write_string(&mut stream, &self.config.id)
            .await
            .context("sending island id")?;
        stream.flush().await?;

        let n_incoming = wire::read_count(&mut stream)
            .await
            .context("reading inbound link count")?;
        let capacity = wire::read_count(&mut stream)
            .await
            .context("reading mailbox capacity")?;
        if capacity == 0 {
            bail!("server sent a zero mailbox capacity");
        }

        let mailbox = Mailbox::start(
            self.config.id.clone(),
            num_subpops,
            capacity,
            n_incoming,
            self.config.mailbox_port,
            self.config.compression,
            self.codec.clone(),
        )
        .await?;
        let addr = mailbox.local_addr();
        wire::write_string(&mut stream, &addr.ip().to_string()).await?;
        wire::write_i32(&mut stream, i32::from(addr.port())).await?;
        stream.flush().await?;
        tracing::info!(island = %self.config.id, mailbox = %addr, inbound = n_incoming, "📫 mailbox listening");

        let synchronous = wire::read_i32(&mut stream).await? != 0;
        let modulo = wire::read_count(&mut stream).await? as u32;
        let offset = wire::read_count(&mut stream).await? as u32;
        let size = wire::read_count(&mut stream).await?;
        let params = ExchangeParams { synchronous, modulo, offset, size };

        let ndest = wire::read_count(&mut stream)
            .await
            .context("reading destination count")?;
        let mut endpoints = Vec::with_capacity(ndest);
        for _ in 0..ndest {
            let id = wire::read_string(&mut stream).await?;
            let host = wire::read_string(&mut stream).await?;
            let port = wire::read_i32(&mut stream).await?;
            let port = u16::try_from(port)
                .with_context(|| format!("server sent bad port {port} for destination {id:?}"))?;
            endpoints.push((id, format!("{host}:{port}")));
        }

        let mut destinations = Vec::with_capacity(ndest);
        for (id, addr) in endpoints {
            let conn = contact_destination(&self.config.id, &id, &addr).await;
            destinations.push(Destination { id, addr, conn });
        }

        wire::write_token(&mut stream, ControlToken::Okay).await?;
        let token = wire::read_token(&mut stream)
            .await
            .context("waiting for the run signal")?;
        if token != ControlToken::Run {
            bail!("server sent {token:?} instead of run");
        }
        tracing::info!(
            island = %self.config.id,
            destinations = destinations.iter().filter(|d| d.conn.is_some()).count(),
            synchronous = params.synchronous,
            "🏁 run signal received"
        );

        let (read, writer) = stream.into_split();
        let (tx, events) = mpsc::channel(16);
        let reader = tokio::spawn(server_reader(read, tx));

        self.link = Some(ServerLink { writer, events, reader });
        self.mailbox = Some(mailbox);
        self.destinations = destinations;
        self.params = Some(params);
        Ok(())
    }

    /// Tear everything down and register again, as after a checkpoint
    /// restore. Migrants buffered in the old mailbox are discarded.
    pub async fn reinitialize_contacts(&mut self, num_subpops: usize) -> Result<()> {
        if let Some(mailbox) = self.mailbox.take() {
            mailbox.shutdown().await;
        }
        if let Some(link) = self.link.take() {
            link.reader.abort();
        }
        self.destinations.clear();
        self.params = None;
        self.initialize_contacts(num_subpops).await
    }

    /// Send emigrants to every live destination. A no-op outside exchange
    /// generations. A write failure marks that destination dead and the
    /// exchange moves on; only a codec failure is propagated.
    pub async fn pre_breeding_exchange(
        &mut self,
        population: &Population<I>,
        generation: u64,
    ) -> Result<()> {
        let Some(params) = self.params else {
            return Ok(());
        };
        if !params.is_exchange_generation(generation) || params.size == 0 {
            return Ok(());
        }
        let compression = self.config.compression;

        for d in 0..self.destinations.len() {
            if self.destinations[d].conn.is_none() {
                continue;
            }
            for (index, subpop) in population.subpops.iter().enumerate() {
                if subpop.is_empty() {
                    continue;
                }
                self.emigrant.prepare(subpop);
                let mut picks = Vec::with_capacity(params.size);
                for _ in 0..params.size {
                    picks.push(self.emigrant.select(&mut self.rng));
                }
                self.emigrant.finish();
                let payload = encode_batch(
                    self.codec.as_ref(),
                    picks.iter().map(|&p| &subpop[p].individual),
                )
                .context("encoding emigrant batch")?;

                let dest = &mut self.destinations[d];
                let Some(conn) = dest.conn.as_mut() else {
                    break;
                };
                if let Err(e) =
                    wire::write_frame(conn, index, picks.len(), &payload, compression).await
                {
                    tracing::warn!(
                        destination = %dest.id,
                        addr = %dest.addr,
                        error = %e,
                        "💀 destination lost — skipping it for the rest of the run"
                    );
                    dest.conn = None;
                    break;
                }
                tracing::trace!(
                    destination = %dest.id,
                    subpop = index,
                    emigrants = picks.len(),
                    generation,
                    "emigrants sent"
                );
            }
        }
        Ok(())
    }

    /// Wait at the server barrier (synchronous runs only), then fold every
    /// buffered immigrant into the population, overwriting
    /// eviction-policy-selected residents and clearing their `evaluated`
    /// flags.
    pub async fn post_breeding_exchange(
        &mut self,
        population: &mut Population<I>,
        generation: u64,
    ) -> Result<()> {
        if let Some(params) = self.params {
            if params.synchronous && params.is_exchange_generation(generation) {
                self.synchronize().await;
            }
        }

        let Some(mailbox) = self.mailbox.as_ref() else {
            return Ok(());
        };
        // One guard across all subpopulations: senders stall briefly while we
        // drain, and the host sees a consistent snapshot.
        let mut rings = mailbox.lock();
        for (index, ring) in rings.iter_mut().enumerate() {
            if ring.count() == 0 {
                continue;
            }
            let immigrants = ring.drain();
            let Some(subpop) = population.subpops.get_mut(index) else {
                continue;
            };
            let n = immigrants.len().min(subpop.len());
            if immigrants.len() > n {
                tracing::warn!(
                    subpop = index,
                    dropped = immigrants.len() - n,
                    "more immigrants than residents — dropping the oldest"
                );
            }
            let skip = immigrants.len() - n;
            self.eviction.prepare(subpop);
            let mut used = vec![false; subpop.len()];
            for individual in immigrants.into_iter().skip(skip) {
                let slot = pick_unused(self.eviction.as_mut(), &mut self.rng, &mut used);
                subpop[slot] = Slot::new(individual);
            }
            self.eviction.finish();
            tracing::debug!(subpop = index, immigrants = n, generation, "📬 immigrants assimilated");
        }
        Ok(())
    }

    /// Check whether the run is over. Sticky: once a reason is returned, the
    /// same reason is returned on every later call.
    ///
    /// `found_ideal` reports that this island's own population contains the
    /// ideal individual; with `quit_on_run_complete` set this ends the whole
    /// run via the server.
    pub async fn run_complete(&mut self, found_ideal: bool) -> Option<String> {
        if let Some(reason) = &self.termination {
            return Some(reason.clone());
        }

        if found_ideal && self.config.quit_on_run_complete {
            if let Some(link) = self.link.as_mut() {
                // Best-effort: the run ends locally either way.
                if let Err(e) = wire::write_token(&mut link.writer, ControlToken::Found).await {
                    tracing::debug!(error = %e, "found report not delivered");
                }
            }
            tracing::info!(island = %self.config.id, "🏆 ideal individual found — ending the run");
            self.termination = Some(REASON_FOUND_LOCALLY.to_string());
            return self.termination.clone();
        }

        if let Some(link) = self.link.as_mut() {
            loop {
                match link.events.try_recv() {
                    Ok(ServerEvent::Goodbye) => {
                        tracing::info!(island = %self.config.id, "👋 server said goodbye — run over");
                        self.termination = Some(REASON_GOODBYE.to_string());
                        break;
                    }
                    Ok(ServerEvent::Closed) | Err(mpsc::error::TryRecvError::Disconnected) => {
                        tracing::warn!(island = %self.config.id, "💀 server connection lost — run over");
                        self.termination = Some(REASON_SERVER_LOST.to_string());
                        break;
                    }
                    Ok(ServerEvent::Okay) => {
                        tracing::debug!("stray barrier release ignored");
                    }
                    Err(mpsc::error::TryRecvError::Empty) => break,
                }
            }
        }
        self.termination.clone()
    }

    /// Shut down the mailbox, the server link and every outbound connection.
    /// With `found_ideal` set, the FOUND report is delivered first (unless
    /// [`ExchangeClient::run_complete`] already sent it).
    pub async fn close_contacts(&mut self, found_ideal: bool) -> Result<()> {
        if let Some(mailbox) = self.mailbox.take() {
            mailbox.shutdown().await;
        }

        let already_reported = self.termination.as_deref() == Some(REASON_FOUND_LOCALLY);
        if let Some(link) = self.link.take() {
            if found_ideal && !already_reported {
                let mut writer = link.writer;
                if let Err(e) = wire::write_token(&mut writer, ControlToken::Found).await {
                    tracing::debug!(error = %e, "found report not delivered");
                }
            }
            link.reader.abort();
        }
        self.destinations.clear();
        self.params = None;

        if let Some(server) = self.embedded_server.take() {
            if found_ideal || self.termination.is_some() {
                // The server ends the run on its own once FOUND is relayed or
                // every island drops; wait for it.
                match server.await {
                    Ok(result) => result?,
                    Err(e) if e.is_cancelled() => {}
                    Err(e) => return Err(e).context("embedded server panicked"),
                }
            } else {
                server.abort();
            }
        }
        tracing::info!(island = %self.config.id, "island exchange closed");
        Ok(())
    }

    /// Signal SYNC and block until the server releases the barrier. Server
    /// loss or a GOODBYE during the wait becomes the termination reason; the
    /// generation finishes either way.
    async fn synchronize(&mut self) {
        if self.termination.is_some() {
            return;
        }
        let Some(link) = self.link.as_mut() else {
            return;
        };
        tracing::debug!(island = %self.config.id, "waiting at the generation barrier");
        if wire::write_token(&mut link.writer, ControlToken::Sync).await.is_err() {
            self.termination = Some(REASON_SERVER_LOST.to_string());
            return;
        }
        loop {
            match link.events.recv().await {
                Some(ServerEvent::Okay) => return,
                Some(ServerEvent::Goodbye) => {
                    self.termination = Some(REASON_GOODBYE.to_string());
                    return;
                }
                Some(ServerEvent::Closed) | None => {
                    self.termination = Some(REASON_SERVER_LOST.to_string());
                    return;
                }
            }
        }
    }

    /// Dial the rendezvous server, retrying forever with a fixed delay. The
    /// server may simply not be up yet.
    async fn connect_server(&self) -> TcpStream {
        loop {
            match TcpStream::connect(&self.config.server_addr).await {
                Ok(stream) => return stream,
                Err(e) => {
                    tracing::warn!(
                        server = %self.config.server_addr,
                        error = %e,
                        retry_in = ?self.config.retry_delay,
                        "rendezvous server not reachable yet"
                    );
                    tokio::time::sleep(self.config.retry_delay).await;
                }
            }
        }
    }
}

/// One attempt to reach a destination mailbox. A destination that is not
/// running (or identifies as someone else) is recorded as dead, not an error:
/// the rest of the topology keeps exchanging.
async fn contact_destination(own_id: &str, dest_id: &str, addr: &str) -> Option<TcpStream> {
    let mut stream = match TcpStream::connect(addr).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(destination = %dest_id, addr = %addr, error = %e, "destination not running");
            return None;
        }
    };
    match wire::handshake_outbound(&mut stream, own_id).await {
        Ok(peer) if peer == dest_id => {
            tracing::debug!(destination = %dest_id, addr = %addr, "destination connected");
            Some(stream)
        }
        Ok(peer) => {
            tracing::warn!(destination = %dest_id, addr = %addr, answered = %peer, "destination identified as someone else");
            None
        }
        Err(e) => {
            tracing::warn!(destination = %dest_id, addr = %addr, error = %e, "destination handshake failed");
            None
        }
    }
}

/// Forward control tokens from the server to the client. EOF or a read error
/// becomes a single `Closed` event.
async fn server_reader(mut read: OwnedReadHalf, tx: mpsc::Sender<ServerEvent>) {
    loop {
        match wire::read_token(&mut read).await {
            Ok(ControlToken::Okay) => {
                if tx.send(ServerEvent::Okay).await.is_err() {
                    return;
                }
            }
            Ok(ControlToken::Goodbye) => {
                let _ = tx.send(ServerEvent::Goodbye).await;
                return;
            }
            Ok(other) => {
                tracing::warn!(token = ?other, "unexpected token from server ignored");
            }
            Err(_) => {
                let _ = tx.send(ServerEvent::Closed).await;
                return;
            }
        }
    }
}

/// Pick a not-yet-replaced slot: redraw through the policy a bounded number
/// of times, then fall back to a linear scan so assimilation always finishes.
fn pick_unused<I>(
    policy: &mut dyn SelectionPolicy<I>,
    rng: &mut StdRng,
    used: &mut [bool],
) -> usize {
    for _ in 0..used.len() * 8 {
        let candidate = policy.select(rng);
        if !used[candidate] {
            used[candidate] = true;
            return candidate;
        }
    }
    let slot = used.iter().position(|&u| !u).unwrap_or(0);
    used[slot] = true;
    slot
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exchange_schedule_respects_offset_and_modulo() {
        let params = ExchangeParams { synchronous: false, modulo: 4, offset: 2, size: 3 };
        assert!(!params.is_exchange_generation(0));
        assert!(!params.is_exchange_generation(1));
        assert!(params.is_exchange_generation(2));
        assert!(!params.is_exchange_generation(3));
        assert!(params.is_exchange_generation(6));
        assert!(params.is_exchange_generation(10));
    }

    #[test]
    fn zero_modulo_exchanges_every_generation_past_offset() {
        let params = ExchangeParams { synchronous: false, modulo: 0, offset: 1, size: 1 };
        assert!(!params.is_exchange_generation(0));
        assert!(params.is_exchange_generation(1));
        assert!(params.is_exchange_generation(2));
        assert!(params.is_exchange_generation(900));
    }

    #[test]
    fn pick_unused_covers_every_slot() {
        struct FirstSlot;
        impl SelectionPolicy<u8> for FirstSlot {
            fn prepare(&mut self, _subpop: &[Slot<u8>]) {}
            fn select(&mut self, _rng: &mut dyn rand::RngCore) -> usize {
                0
            }
        }
        let mut policy = FirstSlot;
        let mut rng = StdRng::seed_from_u64(0);
        let mut used = [false; 3];
        let mut picks = Vec::new();
        for _ in 0..3 {
            picks.push(pick_unused(&mut policy, &mut rng, &mut used));
        }
        picks.sort_unstable();
        assert_eq!(picks, vec![0, 1, 2]);
    }
}

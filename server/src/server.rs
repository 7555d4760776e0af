//! The rendezvous server: one per run.
//!
//! Bootstraps the exchange (registration, parameter distribution, mailbox
//! address resolution), then degrades into a control relay: synchronous
//! barriers, end-of-run broadcast, liveness tracking. Registration and
//! topology errors are fatal; once RUN has been issued, a dropped island is
//! just a dropped island.

use std::net::SocketAddr;

use anyhow::{bail, Context, Result};
use archipelago_protocol::wire::{self, ControlToken};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::topology::Topology;

/// Control events forwarded from per-island reader tasks to the coordinator.
#[derive(Debug, Clone, Copy)]
enum IslandEvent {
    Sync,
    Found,
    Closed,
}

struct Registered {
    idx: usize,
    stream: TcpStream,
    mailbox: (String, u16),
}

pub struct RendezvousServer {
    topology: Topology,
    listener: TcpListener,
}

impl RendezvousServer {
    pub async fn bind(topology: Topology, addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding rendezvous server to {addr}"))?;
        Ok(RendezvousServer { topology, listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Run the full server lifecycle: registration, distribution, steady
    /// state. Returns once the run is over (FOUND relayed, or every island
    /// gone).
    pub async fn run(self) -> Result<()> {
        let regs = self.register_islands().await?;
        let regs = self.distribute_parameters(regs).await?;
        self.steady_state(regs).await
    }

    /// Accept exactly one connection per configured island; read each one's
    /// id and mailbox address, reply with its inbound count and mailbox
    /// capacity. Any protocol violation here is fatal — we are pre-RUN.
    async fn register_islands(&self) -> Result<Vec<Registered>> {
        let n = self.topology.len();
        tracing::info!(islands = n, "🗺️  waiting for islands to register");

        let mut seen = vec![false; n];
        let mut regs: Vec<Registered> = Vec::with_capacity(n);
        while regs.len() < n {
            let (mut stream, peer) = self.listener.accept().await?;
            let id = wire::read_string(&mut stream)
                .await
                .context("reading island id at registration")?;
            let Some(idx) = self.topology.index_of(&id) else {
                bail!("unknown island id {id:?} at registration");
            };
            if seen[idx] {
                bail!("duplicate registration for island {id:?}");
            }
            seen[idx] = true;

            let entry = self.topology.entry(idx);
            wire::write_i32(&mut stream, entry.num_incoming as i32).await?;
            wire::write_i32(&mut stream, entry.mailbox_capacity as i32).await?;

            let host = wire::read_string(&mut stream)
                .await
                .context("reading mailbox address")?;
            let port = wire::read_i32(&mut stream).await?;
            let port = u16::try_from(port)
                .with_context(|| format!("island {id:?} sent bad mailbox port {port}"))?;
            // Islands bound to a wildcard address cannot know how peers reach
            // them; substitute the address we actually see them from.
            let host = match host.parse::<std::net::IpAddr>() {
                Ok(ip) if ip.is_unspecified() => peer.ip().to_string(),
                _ if host.is_empty() => peer.ip().to_string(),
                _ => host,
            };

            tracing::info!(island = %id, mailbox = %format!("{host}:{port}"), "📫 island registered");
            regs.push(Registered { idx, stream, mailbox: (host, port) });
        }
        regs.sort_by_key(|r| r.idx);
        Ok(regs)
    }

    /// Tell every island its exchange parameters and where its destinations'
    /// mailboxes live, collect an OKAY from each, then broadcast RUN.
    async fn distribute_parameters(&self, mut regs: Vec<Registered>) -> Result<Vec<Registered>> {
        let mailboxes: Vec<(String, u16)> = regs.iter().map(|r| r.mailbox.clone()).collect();

        for reg in &mut regs {
            let entry = self.topology.entry(reg.idx);
            let stream = &mut reg.stream;
            wire::write_i32(stream, i32::from(self.topology.synchronous)).await?;
            wire::write_i32(stream, entry.modulo as i32).await?;
            wire::write_i32(stream, entry.offset as i32).await?;
            wire::write_i32(stream, entry.size as i32).await?;
            wire::write_i32(stream, entry.destinations.len() as i32).await?;
            for dest in &entry.destinations {
                let didx = self
                    .topology
                    .index_of(dest)
                    .context("destination vanished from validated topology")?;
                let (host, port) = &mailboxes[didx];
                wire::write_string(stream, dest).await?;
                wire::write_string(stream, host).await?;
                wire::write_i32(stream, *port as i32).await?;
            }
        }

        for reg in &mut regs {
            let token = wire::read_token(&mut reg.stream)
                .await
                .with_context(|| {
                    format!(
                        "waiting for okay from island {:?}",
                        self.topology.entry(reg.idx).id
                    )
                })?;
            if token != ControlToken::Okay {
                bail!(
                    "island {:?} answered {token:?} instead of okay",
                    self.topology.entry(reg.idx).id
                );
            }
        }

        for reg in &mut regs {
            wire::write_token(&mut reg.stream, ControlToken::Run).await?;
        }
        tracing::info!("🏁 all islands acknowledged — run started");
        Ok(regs)
    }

    /// Relay control traffic until the run ends. A quiet island is just
    /// quiet; a closed connection marks that island dead and the run goes on
    /// while at least one island remains.
    async fn steady_state(&self, regs: Vec<Registered>) -> Result<()> {
        let n = self.topology.len();
        let (tx, mut rx) = mpsc::channel::<(usize, IslandEvent)>(64);

        let mut writers: Vec<Option<OwnedWriteHalf>> = (0..n).map(|_| None).collect();
        for reg in regs {
            let (read, write) = reg.stream.into_split();
            writers[reg.idx] = Some(write);
            let id = self.topology.entry(reg.idx).id.clone();
            tokio::spawn(island_reader(reg.idx, id, read, tx.clone()));
        }
        drop(tx);

        let mut alive = vec![true; n];
        let mut waiting = vec![false; n];
        loop {
            let Some((idx, event)) = rx.recv().await else {
                tracing::info!("all island connections gone — shutting down");
                return Ok(());
            };
            let id = &self.topology.entry(idx).id;
            match event {
                IslandEvent::Closed => {
                    alive[idx] = false;
                    waiting[idx] = false;
                    writers[idx] = None;
                    let remaining = alive.iter().filter(|&&a| a).count();
                    tracing::warn!(island = %id, remaining, "💀 island connection lost");
                    if remaining == 0 {
                        tracing::info!("no live islands remain — shutting down");
                        return Ok(());
                    }
                    // A dead island must not hold up the barrier.
                    release_barrier_if_ready(&alive, &mut waiting, &mut writers).await;
                }
                IslandEvent::Found => {
                    tracing::info!(island = %id, "🏆 ideal individual reported — saying goodbye");
                    for (widx, writer) in writers.iter_mut().enumerate() {
                        if !alive[widx] {
                            continue;
                        }
                        if let Some(writer) = writer {
                            if let Err(e) = wire::write_token(writer, ControlToken::Goodbye).await {
                                tracing::debug!(
                                    island = %self.topology.entry(widx).id,
                                    error = %e,
                                    "goodbye not delivered"
                                );
                            }
                        }
                    }
                    return Ok(());
                }
                IslandEvent::Sync => {
                    tracing::debug!(island = %id, "island at barrier");
                    waiting[idx] = true;
                    release_barrier_if_ready(&alive, &mut waiting, &mut writers).await;
                }
            }
        }
    }
}

/// When every live island has signaled SYNC, release them all with OKAY and
/// clear the wait set.
async fn release_barrier_if_ready(
    alive: &[bool],
    waiting: &mut [bool],
    writers: &mut [Option<OwnedWriteHalf>],
) {
    let any_waiting = waiting.iter().any(|&w| w);
    let all_live_waiting = alive
        .iter()
        .zip(waiting.iter())
        .all(|(&a, &w)| !a || w);
    if !any_waiting || !all_live_waiting {
        return;
    }
    tracing::debug!("barrier complete — releasing all islands");
    for (idx, writer) in writers.iter_mut().enumerate() {
        if !alive[idx] {
            continue;
        }
        if let Some(writer) = writer {
            if let Err(e) = wire::write_token(writer, ControlToken::Okay).await {
                tracing::debug!(error = %e, "barrier release not delivered");
            }
        }
    }
    waiting.fill(false);
}

/// Forward control tokens from one island to the coordinator. EOF or any
/// read error is reported as `Closed`; the coordinator decides what that
/// means for the run.
async fn island_reader(
    idx: usize,
    id: String,
    mut read: OwnedReadHalf,
    tx: mpsc::Sender<(usize, IslandEvent)>,
) {
    loop {
        match wire::read_token(&mut read).await {
            Ok(ControlToken::Sync) => {
                if tx.send((idx, IslandEvent::Sync)).await.is_err() {
                    return;
                }
            }
            Ok(ControlToken::Found) => {
                let _ = tx.send((idx, IslandEvent::Found)).await;
                return;
            }
            Ok(other) => {
                tracing::warn!(island = %id, token = ?other, "unexpected token ignored");
            }
            Err(_) => {
                let _ = tx.send((idx, IslandEvent::Closed)).await;
                return;
            }
        }
    }
}

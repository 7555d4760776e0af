//! Demo island: a small real-valued GA minimizing the sphere function, with
//! migration wired through the archipelago exchange. One process per island;
//! pass `--serve` on exactly one of them to embed the rendezvous server.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::{Buf, BufMut, BytesMut};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing_subscriber::EnvFilter;

use archipelago_island::{
    build_policy, ExchangeClient, IslandConfig, SelectionKind,
};
use archipelago_protocol::codec::{Codec, CodecError};
use archipelago_protocol::wire::Compression;
use archipelago_protocol::{Population, Slot};
use archipelago_server::{RendezvousServer, Topology, TopologyFile};

#[derive(Parser)]
#[command(name = "archipelago-island", about = "Archipelago demo island")]
struct Cli {
    /// This island's id as declared in the topology
    #[arg(long, env = "ARCHIPELAGO_ID")]
    id: String,

    /// Rendezvous server address, host:port
    #[arg(long, default_value = "127.0.0.1:7451", env = "ARCHIPELAGO_SERVER")]
    server: String,

    /// Mailbox listen port; 0 picks an ephemeral port
    #[arg(long, default_value = "0")]
    mailbox_port: u16,

    /// Deflate-compress migration payloads (must match every peer)
    #[arg(long)]
    compress: bool,

    /// Also run the rendezvous server, from this topology JSON file
    #[arg(long)]
    serve: Option<std::path::PathBuf>,

    /// Generations to run before giving up
    #[arg(long, default_value = "200")]
    generations: u64,

    /// Individuals per subpopulation
    #[arg(long, default_value = "50")]
    population: usize,

    /// Genome length
    #[arg(long, default_value = "10")]
    dimensions: usize,

    /// Error below which the ideal individual is declared found
    #[arg(long, default_value = "1e-6")]
    target: f64,

    /// RNG seed; omit for an OS-seeded run
    #[arg(long)]
    seed: Option<u64>,
}

/// A real-valued candidate with its sphere-function error.
#[derive(Debug, Clone)]
struct Candidate {
    genes: Vec<f64>,
    error: f64,
}

impl Candidate {
    fn evaluate(&mut self) {
        self.error = self.genes.iter().map(|g| g * g).sum();
    }
}

/// Migration encoding: gene count, genes, error, all big-endian.
struct CandidateCodec;

impl Codec<Candidate> for CandidateCodec {
    fn encode(&self, individual: &Candidate, buf: &mut BytesMut) -> Result<(), CodecError> {
        buf.put_u32(individual.genes.len() as u32);
        for gene in &individual.genes {
            buf.put_f64(*gene);
        }
        buf.put_f64(individual.error);
        Ok(())
    }

    fn decode(&self, buf: &mut &[u8]) -> Result<Candidate, CodecError> {
        if buf.len() < 4 {
            return Err(CodecError::new("truncated candidate"));
        }
        let len = buf.get_u32() as usize;
        if buf.len() < (len + 1) * 8 {
            return Err(CodecError::new("truncated candidate"));
        }
        let genes = (0..len).map(|_| buf.get_f64()).collect();
        let error = buf.get_f64();
        Ok(Candidate { genes, error })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    let mut config = IslandConfig::new(cli.id.clone(), cli.server.clone());
    config.mailbox_port = cli.mailbox_port;
    config.seed = cli.seed;
    if cli.compress {
        config.compression = Compression::Deflate;
    }
    // The demo retries quickly; co-started processes race the server up.
    config.retry_delay = Duration::from_millis(500);

    let mut client = ExchangeClient::new(
        config,
        Arc::new(CandidateCodec),
        build_policy(SelectionKind::TournamentBest(2), |c: &Candidate| c.error),
        build_policy(SelectionKind::TournamentWorst(2), |c: &Candidate| c.error),
    );

    if let Some(path) = &cli.serve {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading topology file {}", path.display()))?;
        let file: TopologyFile = serde_json::from_str(&raw).context("parsing topology JSON")?;
        let topology = Topology::build(file)?;
        let port = cli
            .server
            .rsplit(':')
            .next()
            .and_then(|p| p.parse::<u16>().ok())
            .context("--server must end in :port when --serve is used")?;
        let server = RendezvousServer::bind(topology, &format!("0.0.0.0:{port}")).await?;
        tracing::info!(port, "🗺️  embedded rendezvous server up");
        client.attach_server(tokio::spawn(server.run()));
    }

    let mut rng = match cli.seed {
        Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(1)),
        None => StdRng::from_os_rng(),
    };
    let mut population = Population::from_fn(1, cli.population, |_, _| Candidate {
        genes: (0..cli.dimensions).map(|_| rng.random_range(-5.0..5.0)).collect(),
        error: f64::INFINITY,
    });
    evaluate(&mut population);
    tracing::info!(island = %cli.id, size = cli.population, "🌱 population initialized");

    client.initialize_contacts(population.num_subpops()).await?;

    let mut found = false;
    for generation in 0..cli.generations {
        client.pre_breeding_exchange(&population, generation).await?;
        breed(&mut population, &mut rng);
        client.post_breeding_exchange(&mut population, generation).await?;
        evaluate(&mut population);

        let best = best_error(&population);
        found = best <= cli.target;
        if generation % 20 == 0 || found {
            tracing::info!(island = %cli.id, generation, best, "📋 progress");
        }
        if let Some(reason) = client.run_complete(found).await {
            tracing::info!(island = %cli.id, generation, reason, "run complete");
            break;
        }
    }

    client.close_contacts(found).await?;
    tracing::info!(island = %cli.id, best = best_error(&population), "island done");
    Ok(())
}

fn evaluate(population: &mut Population<Candidate>) {
    for slot in population.subpops.iter_mut().flatten() {
        if !slot.evaluated {
            slot.individual.evaluate();
            slot.evaluated = true;
        }
    }
}

fn best_error(population: &Population<Candidate>) -> f64 {
    population
        .subpops
        .iter()
        .flatten()
        .map(|slot| slot.individual.error)
        .fold(f64::INFINITY, f64::min)
}

/// One generation of size-2 tournaments, uniform crossover and gaussian-ish
/// mutation, elitist in the single best individual.
fn breed(population: &mut Population<Candidate>, rng: &mut StdRng) {
    for subpop in &mut population.subpops {
        if subpop.len() < 2 {
            continue;
        }
        let elite = subpop
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| a.individual.error.total_cmp(&b.individual.error))
            .map(|(i, _)| i)
            .unwrap_or(0);
        let mut next = Vec::with_capacity(subpop.len());
        next.push(subpop[elite].clone());
        while next.len() < subpop.len() {
            let a = tournament(subpop, rng);
            let b = tournament(subpop, rng);
            let genes: Vec<f64> = subpop[a]
                .individual
                .genes
                .iter()
                .zip(&subpop[b].individual.genes)
                .map(|(&x, &y)| {
                    let gene = if rng.random_range(0..2) == 0 { x } else { y };
                    if rng.random_range(0.0..1.0) < 0.1 {
                        gene + rng.random_range(-0.5..0.5)
                    } else {
                        gene
                    }
                })
                .collect();
            next.push(Slot::new(Candidate { genes, error: f64::INFINITY }));
        }
        *subpop = next;
    }
}

fn tournament(subpop: &[Slot<Candidate>], rng: &mut StdRng) -> usize {
    let a = rng.random_range(0..subpop.len());
    let b = rng.random_range(0..subpop.len());
    if subpop[a].individual.error <= subpop[b].individual.error {
        a
    } else {
        b
    }
}

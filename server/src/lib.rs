//! Rendezvous server for the archipelago island-model exchange.
//!
//! One server per run: it resolves the static topology, waits for every
//! island to register and report its mailbox address, distributes peer
//! endpoints and traffic parameters, then relays control signals (barrier
//! SYNC, end-of-run GOODBYE) until the run is over.

pub mod server;
pub mod topology;

pub use server::RendezvousServer;
pub use topology::{IslandEntry, IslandSpec, Topology, TopologyFile};

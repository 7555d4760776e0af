use std::time::Duration;

use archipelago_protocol::Compression;

/// Local configuration for one island's exchange agent.
#[derive(Debug, Clone)]
pub struct IslandConfig {
    /// This island's id as declared in the server topology.
    pub id: String,
    /// Rendezvous server address, `host:port`.
    pub server_addr: String,
    /// Port the mailbox listens on; 0 picks an ephemeral port.
    pub mailbox_port: u16,
    /// Payload compression; must match the setting on every peer.
    pub compression: Compression,
    /// Fixed backoff between attempts to reach the rendezvous server.
    pub retry_delay: Duration,
    /// Terminate the run when this island finds the ideal individual.
    pub quit_on_run_complete: bool,
    /// Seed for the selection RNG; `None` seeds from the OS.
    pub seed: Option<u64>,
}

impl IslandConfig {
    pub fn new(id: impl Into<String>, server_addr: impl Into<String>) -> Self {
        IslandConfig {
            id: id.into(),
            server_addr: server_addr.into(),
            mailbox_port: 0,
            compression: Compression::None,
            retry_delay: Duration::from_secs(5),
            quit_on_run_complete: true,
            seed: None,
        }
    }
}

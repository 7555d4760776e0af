//! Static exchange topology: who sends to whom, how often, how much.
//!
//! Built once at server setup and immutable afterwards. All referential
//! integrity problems are fatal here, before any networking starts.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// One island's entry as written in a topology file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IslandSpec {
    pub id: String,
    /// Exchange every `modulo` generations; 0 means every generation.
    #[serde(default)]
    pub modulo: u32,
    /// First generation at which this island exchanges.
    #[serde(default)]
    pub offset: u32,
    /// Emigrants sent per destination per subpopulation.
    pub size: usize,
    /// Ring-buffer capacity of this island's mailbox, per subpopulation.
    pub mailbox_capacity: usize,
    /// Ids of the islands this one sends emigrants to.
    #[serde(default)]
    pub destinations: Vec<String>,
}

/// On-disk topology document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopologyFile {
    pub islands: Vec<IslandSpec>,
    /// Barrier-locked exchange. When set, `sync_modulo`/`sync_offset`
    /// override every island's own modulo and offset.
    #[serde(default)]
    pub synchronous: bool,
    #[serde(default)]
    pub sync_modulo: Option<u32>,
    #[serde(default)]
    pub sync_offset: Option<u32>,
}

/// A resolved island entry, including how many peers will dial its mailbox.
#[derive(Debug, Clone)]
pub struct IslandEntry {
    pub id: String,
    pub modulo: u32,
    pub offset: u32,
    pub size: usize,
    pub mailbox_capacity: usize,
    pub destinations: Vec<String>,
    pub num_incoming: usize,
}

/// The validated, immutable topology. Island order follows the file.
#[derive(Debug, Clone)]
pub struct Topology {
    entries: Vec<IslandEntry>,
    index: HashMap<String, usize>,
    pub synchronous: bool,
}

impl Topology {
    pub fn build(file: TopologyFile) -> Result<Self> {
        if file.islands.is_empty() {
            bail!("topology has no islands");
        }

        let mut index = HashMap::new();
        for (i, spec) in file.islands.iter().enumerate() {
            if index.insert(spec.id.clone(), i).is_some() {
                bail!("duplicate island id {:?} in topology", spec.id);
            }
            if spec.size == 0 {
                bail!("island {:?} has exchange size 0", spec.id);
            }
            if spec.mailbox_capacity == 0 {
                bail!("island {:?} has mailbox capacity 0", spec.id);
            }
        }

        let (sync_modulo, sync_offset) = if file.synchronous {
            let modulo = file
                .sync_modulo
                .context("synchronous topology requires sync_modulo")?;
            let offset = file
                .sync_offset
                .context("synchronous topology requires sync_offset")?;
            (Some(modulo), Some(offset))
        } else {
            (None, None)
        };

        let mut incoming = vec![0usize; file.islands.len()];
        for spec in &file.islands {
            for dest in &spec.destinations {
                let Some(&target) = index.get(dest) else {
                    bail!(
                        "island {:?} lists unknown destination {:?}",
                        spec.id,
                        dest
                    );
                };
                incoming[target] += 1;
            }
        }

        let entries = file
            .islands
            .into_iter()
            .enumerate()
            .map(|(i, spec)| IslandEntry {
                id: spec.id,
                modulo: sync_modulo.unwrap_or(spec.modulo),
                offset: sync_offset.unwrap_or(spec.offset),
                size: spec.size,
                mailbox_capacity: spec.mailbox_capacity,
                destinations: spec.destinations,
                num_incoming: incoming[i],
            })
            .collect();

        Ok(Topology {
            entries,
            index,
            synchronous: file.synchronous,
        })
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let file: TopologyFile =
            serde_json::from_str(json).context("parsing topology JSON")?;
        Self::build(file)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn entry(&self, index: usize) -> &IslandEntry {
        &self.entries[index]
    }

    pub fn entries(&self) -> impl Iterator<Item = &IslandEntry> {
        self.entries.iter()
    }
}

//! Island-side half of the archipelago exchange.
//!
//! An island embeds an [`ExchangeClient`] in its evolutionary loop. The
//! client registers with the rendezvous server, runs a [`Mailbox`] for
//! inbound migrants, and dials peer mailboxes for outbound ones:
//!
//! ```text
//!   host loop ── pre_breeding_exchange ──▶ peer mailboxes (TCP)
//!   host loop ◀─ post_breeding_exchange ── own Mailbox ◀── peers
//!   host loop ── run_complete / close_contacts ──▶ rendezvous server
//! ```
//!
//! Individuals are opaque here; the host supplies a
//! [`Codec`](archipelago_protocol::Codec) and two [`SelectionPolicy`]
//! instances (who emigrates, who gets evicted) and keeps ownership of
//! breeding and evaluation.

pub mod client;
pub mod config;
pub mod mailbox;
pub mod select;

pub use client::{
    ExchangeClient, ExchangeParams, REASON_FOUND_LOCALLY, REASON_GOODBYE, REASON_SERVER_LOST,
};
pub use config::IslandConfig;
pub use mailbox::{Mailbox, RingBuffer};
pub use select::{build_policy, RandomSelection, SelectionKind, SelectionPolicy, TournamentSelection};

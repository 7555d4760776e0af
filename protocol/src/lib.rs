//! Archipelago Exchange Protocol
//!
//! Islands are independent evolutionary-algorithm processes that periodically
//! trade individuals over TCP. A single rendezvous server bootstraps peer
//! addressing and relays control signals; migration itself is peer-to-peer.
//!
//! # Architecture
//!
//! ```text
//!              ┌────────────┐
//!              │ rendezvous │  register / params / SYNC / GOODBYE
//!              │   server   │◄───────────────┐
//!              └─────┬──────┘                │
//!          ┌─────────┼─────────┐             │
//!          ▼         ▼         ▼             │
//!     ┌────────┐ ┌────────┐ ┌────────┐       │
//!     │island A│ │island B│ │island C│───────┘
//!     └───┬────┘ └───▲────┘ └────────┘
//!         │ migrants │
//!         └──────────┘  (direct TCP, island → peer mailbox)
//! ```
//!
//! ## Wire format
//! - Big-endian `i32` scalars, length-prefixed UTF-8 strings.
//! - Control tokens (`okay`, `sync`, `found`, `bye-bye`, `run`) are ordinary
//!   strings; protocol state decides how the next bytes are interpreted.
//! - Migration frame: subpopulation index, batch size, then a payload blob
//!   of back-to-back self-delimiting individual encodings, optionally
//!   deflate-compressed by symmetric local configuration.

pub mod codec;
pub mod population;
pub mod wire;

pub use codec::{decode_batch, encode_batch, Codec, CodecError};
pub use population::{Population, Slot};
pub use wire::{Compression, ControlToken, WireError};

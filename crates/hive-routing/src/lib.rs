//! `hive-routing` — client-side routing over a swarm of block servers.
//!
//! A model is split into consecutive blocks, and each server peer hosts a
//! contiguous range of them. This crate decides which peers to chain for a
//! requested block range, runs forward and backward passes along that chain,
//! and keeps stateful inference sessions alive across peer failures.
//!
//! ```text
//!             ┌───────────────────┐
//!             │  SequenceManager  │◀── background refresh ── PeerRegistry
//!             │  PeerDirectory    │
//!             │  PeerLiveness     │
//!             └─────────┬─────────┘
//!          make_sequence│
//!     ┌─────────────────┴──────────────────┐
//!     ▼                                    ▼
//! ChainExecutor                     InferenceSession
//! forward / backward                step / close
//!     │                                    │
//!     └────────── BlockTransport ──────────┘
//!       [0, 4)→A      [4, 8)→B      [8, 10)→C
//! ```

pub mod compression;
pub mod directory;
pub mod error;
pub mod executor;
pub mod liveness;
pub mod manager;
pub mod remote_chain;
pub mod sequence;
pub mod session;

#[cfg(test)]
mod testing;

// ── Public re-exports ────────────────────────────────────────────────────────

pub use compression::{CompressionPolicy, DeclaredCompression, ProtocolCompression};
pub use directory::{DirectoryView, PeerDirectory};
pub use error::{Result, RoutingError};
pub use executor::{ChainExecutor, ForwardPass, Gradients, TraceEntry};
pub use liveness::PeerLiveness;
pub use manager::SequenceManager;
pub use remote_chain::RemoteChain;
pub use sequence::{FastestSelector, PeerSelector, RandomSelector, RoutingMode, Sequence, Span};
pub use session::{InferenceSession, SessionState};

// ── Module declarations ───────────────────────────────────────────────────────

pub mod announce;
pub mod codec;
pub mod compression;
pub mod error;
pub mod registry;
pub mod sim;
pub mod transport;

// ── Public re-exports ─────────────────────────────────────────────────────────

pub use announce::{decode_announcement, encode_announcement, ServerAnnouncement, TOPIC_ANNOUNCE};
pub use codec::{BlockCodec, BlockRequest, BlockResponse, RemoteErrorKind, BLOCK_RPC_PROTOCOL};
pub use compression::{deserialize_tensor, serialize_tensor, WireTensor, QUANT_BLOCK_SIZE};
pub use error::{NetError, Result};
pub use registry::{AnnouncementRegistry, PeerRegistry};
pub use sim::{run_backward, run_forward, BlockCache, SimBlock, SimulatedPeer};
pub use transport::{BlockTransport, CallRecord, Fault, LoopbackTransport, RequestHandler};

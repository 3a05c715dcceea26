pub mod block;
pub mod config;
pub mod error;
pub mod peer;
pub mod schema;
pub mod tensor;

pub use block::{BlockRange, BlockUid, UID_DELIMITER};
pub use config::{ClientConfig, RoutingConfig, SessionConfig};
pub use error::{HiveError, Result};
pub use peer::{PeerId, PeerRecord};
pub use schema::{CompressionType, Protocol, RequestMetadata, RpcInfo, TensorDescriptor, TensorRole};
pub use tensor::Tensor;

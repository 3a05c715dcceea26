// hive-net::codec — BlockCodec for the `/hive/block-rpc/1` request-response
// protocol. Carries forward, backward and inference-step calls to the peer
// serving a span of blocks.
//
// Wire format: [u32 big-endian length][bincode payload]
// Bincode because every message carries raw tensor payloads; it writes
// `Vec<u8>` as length + raw bytes with no per-byte overhead.

use std::io;

use async_trait::async_trait;
use futures::prelude::*;
use serde::{Deserialize, Serialize};

use hive_types::{BlockUid, RequestMetadata, RpcInfo};

use crate::compression::WireTensor;
use crate::error::{NetError, Result};

/// Protocol identifier negotiated during substream opening.
pub const BLOCK_RPC_PROTOCOL: &str = "/hive/block-rpc/1";

/// Safety limit: reject any single message larger than 256 MiB.
const MAX_MSG_BYTES: usize = 256 * 1024 * 1024;

// ── Message Types ─────────────────────────────────────────────────────────────

/// A call against the blocks `uids` hosted by one peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BlockRequest {
    /// Ask for the declared input/output schema of a block.
    Info { uid: BlockUid },

    /// Run `uids` in order over `hidden`.
    Forward {
        uids: Vec<BlockUid>,
        hidden: WireTensor,
        /// `[batch, seq]`, carried unchanged from hop to hop.
        attention_mask: Option<WireTensor>,
        /// `[len(uids), batch, pre_seq, hidden]`; entry `k` is added to the
        /// hidden-state prefix before block `k`.
        prompts: Option<WireTensor>,
        metadata: RequestMetadata,
    },

    /// Gradient of `uids` at `inputs` given the gradient of their outputs.
    Backward {
        uids: Vec<BlockUid>,
        inputs: WireTensor,
        grad_outputs: WireTensor,
        attention_mask: Option<WireTensor>,
        prompts: Option<WireTensor>,
        metadata: RequestMetadata,
    },

    /// One incremental decoding step inside a peer-side session.
    ///
    /// `hidden` covers absolute positions `start_position ..`; the peer
    /// rejects the call unless its cache holds exactly `start_position`
    /// positions.
    InferenceStep {
        uids: Vec<BlockUid>,
        session_id: String,
        start_position: u32,
        max_length: u32,
        lease_ms: u64,
        hidden: WireTensor,
        metadata: RequestMetadata,
    },

    /// Release the peer-side state of a session.
    CloseSession { session_id: String },
}

impl BlockRequest {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Info { .. } => "info",
            Self::Forward { .. } => "forward",
            Self::Backward { .. } => "backward",
            Self::InferenceStep { .. } => "inference_step",
            Self::CloseSession { .. } => "close_session",
        }
    }
}

/// Failure classes a peer can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteErrorKind {
    /// The request does not match the declared schema. Retrying won't help.
    SchemaMismatch,
    /// The peer does not serve a requested block.
    NotServed,
    /// Well-formed but unacceptable, e.g. a step past `max_length`.
    InvalidRequest,
    /// Session unknown, expired, or position out of order.
    SessionState,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BlockResponse {
    Info(RpcInfo),
    Forward {
        outputs: WireTensor,
    },
    Backward {
        grad_inputs: WireTensor,
        grad_prompts: Option<WireTensor>,
    },
    InferenceStep {
        outputs: WireTensor,
    },
    Closed,
    Error {
        kind: RemoteErrorKind,
        message: String,
    },
}

impl BlockResponse {
    pub fn error(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self::Error { kind, message: message.into() }
    }

    /// Turn an `Error` reply into [`NetError::Remote`].
    pub fn into_result(self) -> Result<Self> {
        match self {
            Self::Error { kind, message } => Err(NetError::Remote { kind, message }),
            other => Ok(other),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Info(_) => "info",
            Self::Forward { .. } => "forward",
            Self::Backward { .. } => "backward",
            Self::InferenceStep { .. } => "inference_step",
            Self::Closed => "closed",
            Self::Error { .. } => "error",
        }
    }
}

// ── Codec ─────────────────────────────────────────────────────────────────────

/// Codec for the `/hive/block-rpc/1` request-response protocol.
#[derive(Debug, Clone)]
pub struct BlockCodec {
    max_msg_bytes: usize,
}

impl Default for BlockCodec {
    fn default() -> Self {
        Self {
            max_msg_bytes: MAX_MSG_BYTES,
        }
    }
}

#[async_trait]
impl libp2p::request_response::Codec for BlockCodec {
    type Protocol = String;
    type Request = BlockRequest;
    type Response = BlockResponse;

    async fn read_request<T>(
        &mut self,
        _protocol: &Self::Protocol,
        io: &mut T,
    ) -> io::Result<Self::Request>
    where
        T: AsyncRead + Unpin + Send,
    {
        let buf = read_length_prefixed(io, self.max_msg_bytes).await?;
        decode_frame(&buf)
    }

    async fn read_response<T>(
        &mut self,
        _protocol: &Self::Protocol,
        io: &mut T,
    ) -> io::Result<Self::Response>
    where
        T: AsyncRead + Unpin + Send,
    {
        let buf = read_length_prefixed(io, self.max_msg_bytes).await?;
        decode_frame(&buf)
    }

    async fn write_request<T>(
        &mut self,
        _protocol: &Self::Protocol,
        io: &mut T,
        req: Self::Request,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        write_length_prefixed(io, &encode_frame(&req)?).await
    }

    async fn write_response<T>(
        &mut self,
        _protocol: &Self::Protocol,
        io: &mut T,
        resp: Self::Response,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        write_length_prefixed(io, &encode_frame(&resp)?).await
    }
}

// ── Wire Helpers ──────────────────────────────────────────────────────────────

fn encode_frame<M: Serialize>(msg: &M) -> io::Result<Vec<u8>> {
    bincode::serde::encode_to_vec(msg, bincode::config::standard())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
}

fn decode_frame<M: serde::de::DeserializeOwned>(buf: &[u8]) -> io::Result<M> {
    let (msg, _) = bincode::serde::decode_from_slice(buf, bincode::config::standard())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    Ok(msg)
}

/// Read a `[u32 BE length][payload]` frame.
async fn read_length_prefixed<T>(io: &mut T, max_bytes: usize) -> io::Result<Vec<u8>>
where
    T: AsyncRead + Unpin + Send,
{
    let mut len_buf = [0u8; 4];
    io.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_bytes {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("message too large: {len} bytes (max {max_bytes})"),
        ));
    }
    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Write a `[u32 BE length][payload]` frame.
async fn write_length_prefixed<T>(io: &mut T, data: &[u8]) -> io::Result<()>
where
    T: AsyncWrite + Unpin + Send,
{
    let len = u32::try_from(data.len()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("payload exceeds u32::MAX: {} bytes", data.len()),
        )
    })?;
    io.write_all(&len.to_be_bytes()).await?;
    io.write_all(data).await?;
    io.flush().await?;
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

//! Control messages and the client/server handshake.
//!
//! Every message travels as a length-prefixed frame:
//!
//! ```text
//! ┌──────────────────────┬──────────────────────────────┐
//! │  Length (4 bytes BE) │  bincode-encoded `Msg`        │
//! └──────────────────────┴──────────────────────────────┘
//! ```
//!
//! A receiver refuses frames that declare more than [`MAX_MESSAGE_SIZE`]
//! bytes without reading the body.
//!
//! # Handshake
//!
//! 1. Client sends `Syn` carrying the [`TestId`] and its [`ClientParam`]
//! 2. Server answers with `Ack`
//!
//! Anything else, including a frame that fails to decode, is a failed
//! handshake and the connection is abandoned. There are no retries here.

use crate::config::TestId;
use crate::{Error, Result};
use log::debug;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Current protocol version for client-server communication.
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest message body a peer may declare.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024;

/// Parameters a client asks the server to run a test with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientParam {
    pub num_threads: u32,
    pub buffer_size: u32,
    pub rtt_count: u32,
    pub reverse: bool,
    pub duration: Duration,
    pub gap: Duration,
    pub warmup_count: u32,
    /// Target rate in bits per second, 0 for unlimited
    pub bw_rate: u64,
    pub tos: u8,
}

impl Default for ClientParam {
    fn default() -> Self {
        Self {
            num_threads: 1,
            buffer_size: 16 * 1024,
            rtt_count: 1000,
            reverse: false,
            duration: Duration::from_secs(10),
            gap: Duration::ZERO,
            warmup_count: 1,
            bw_rate: 0,
            tos: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynMsg {
    pub test_id: TestId,
    pub client_param: ClientParam,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AckMsg {}

/// Discriminator of a received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    Invalid,
    Syn,
    Ack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MsgBody {
    /// Stand-in for anything that could not be read or decoded
    Invalid,
    Syn(SynMsg),
    Ack(AckMsg),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Msg {
    pub version: u32,
    pub body: MsgBody,
}

impl Msg {
    pub fn syn(test_id: TestId, client_param: ClientParam) -> Self {
        Msg {
            version: PROTOCOL_VERSION,
            body: MsgBody::Syn(SynMsg {
                test_id,
                client_param,
            }),
        }
    }

    pub fn ack() -> Self {
        Msg {
            version: PROTOCOL_VERSION,
            body: MsgBody::Ack(AckMsg {}),
        }
    }

    pub fn invalid() -> Self {
        Msg {
            version: PROTOCOL_VERSION,
            body: MsgBody::Invalid,
        }
    }

    pub fn msg_type(&self) -> MsgType {
        match self.body {
            MsgBody::Invalid => MsgType::Invalid,
            MsgBody::Syn(_) => MsgType::Syn,
            MsgBody::Ack(_) => MsgType::Ack,
        }
    }
}

/// Serializes a message into a length-prefixed frame.
///
/// # Examples
///
/// ```
/// use ethrs::protocol::{serialize_message, Msg};
///
/// let bytes = serialize_message(&Msg::ack()).expect("Serialization failed");
/// let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
/// assert_eq!(len as usize, bytes.len() - 4);
/// ```
pub fn serialize_message(msg: &Msg) -> Result<Vec<u8>> {
    let body = bincode::serialize(msg)?;
    if body.len() > MAX_MESSAGE_SIZE {
        return Err(Error::Protocol(format!(
            "Message of {} bytes exceeds limit of {}",
            body.len(),
            MAX_MESSAGE_SIZE
        )));
    }
    let len = body.len() as u32;
    let mut result = Vec::with_capacity(4 + body.len());
    result.extend_from_slice(&len.to_be_bytes());
    result.extend_from_slice(&body);
    Ok(result)
}

/// Reads one length-prefixed message from `reader`.
///
/// # Errors
///
/// Fails if the stream ends early, the declared length exceeds
/// [`MAX_MESSAGE_SIZE`], or the body does not decode.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Msg> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;

    if len > MAX_MESSAGE_SIZE {
        return Err(Error::Protocol(format!(
            "Declared message length {} exceeds limit of {}",
            len, MAX_MESSAGE_SIZE
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;

    let msg = bincode::deserialize(&body)?;
    Ok(msg)
}

/// Like [`read_message`], but folds every failure into an `Invalid` message.
pub async fn recv_message<R: AsyncRead + Unpin>(reader: &mut R) -> Msg {
    match read_message(reader).await {
        Ok(msg) => msg,
        Err(e) => {
            debug!("Failed to receive message: {}", e);
            Msg::invalid()
        }
    }
}

pub async fn send_message<W: AsyncWrite + Unpin>(writer: &mut W, msg: &Msg) -> Result<()> {
    let bytes = serialize_message(msg)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Client side of the handshake: send SYN, require ACK.
pub async fn handshake_client<S>(stream: &mut S, test_id: TestId, param: ClientParam) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    send_message(stream, &Msg::syn(test_id, param)).await?;

    let reply = recv_message(stream).await;
    match reply.msg_type() {
        MsgType::Ack => Ok(()),
        other => Err(Error::Handshake(format!("Expected ACK, received {:?}", other))),
    }
}

/// Server side of the handshake: require SYN, reply ACK.
///
/// Returns the requested test and the client's parameters.
pub async fn handshake_server<S>(stream: &mut S) -> Result<(TestId, ClientParam)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let msg = recv_message(stream).await;
    let syn = match msg.body {
        MsgBody::Syn(syn) => syn,
        _ => {
            return Err(Error::Handshake(format!(
                "Expected SYN, received {:?}",
                msg.msg_type()
            )))
        }
    };
    if msg.version != PROTOCOL_VERSION {
        debug!(
            "Peer protocol version {} differs from ours ({})",
            msg.version, PROTOCOL_VERSION
        );
    }

    send_message(stream, &Msg::ack()).await?;
    Ok((syn.test_id, syn.client_param))
}

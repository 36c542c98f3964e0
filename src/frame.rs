use crate::RpcError;
use bit_field::BitField;
use bytes::Bytes;
use futures_util::{AsyncReadExt, AsyncWriteExt};
use std::ops::Range;

pub type RpcMsgSendId = u16;

const TAG_BITS: Range<usize> = 0..4;
const STATUS_BITS: Range<usize> = 4..8;
const METHOD_LEN_BITS: Range<usize> = 8..16;
const SEND_ID_BITS: Range<usize> = 16..32;
const PAYLOAD_LEN_BITS: Range<usize> = 32..64;

const TAG_CALL: u64 = 1;
const TAG_REPLY: u64 = 2;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyStatus {
    Ok = 0,
    Unimplemented = 1,
    InvocationFailed = 2,
    BadRequest = 3,
    /// The server could not encode the reply.
    SerdeFailed = 4,
    /// The handler failed with a transport error of its own.
    TransportFailed = 5,
}

impl From<ReplyStatus> for u8 {
    fn from(status: ReplyStatus) -> Self {
        status as u8
    }
}

impl TryFrom<u8> for ReplyStatus {
    type Error = RpcError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Ok,
            1 => Self::Unimplemented,
            2 => Self::InvocationFailed,
            3 => Self::BadRequest,
            4 => Self::SerdeFailed,
            5 => Self::TransportFailed,
            _ => return Err(RpcError::InvalidFrame),
        })
    }
}

#[derive(Debug)]
pub struct RpcFrame {
    pub head: RpcFrameHead,
    pub payload: Bytes,
}

/// Frame head. Packed into a big endian `u64`; call frames follow it with the
/// UTF-8 method name, then every frame carries `payload_len` payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcFrameHead {
    Call {
        send_id: RpcMsgSendId,
        method: String,
        payload_len: u32,
    },
    Reply {
        send_id: RpcMsgSendId,
        status: ReplyStatus,
        payload_len: u32,
    },
}

impl RpcFrameHead {
    pub fn send_id(&self) -> RpcMsgSendId {
        match self {
            RpcFrameHead::Call { send_id, .. } | RpcFrameHead::Reply { send_id, .. } => *send_id,
        }
    }

    pub fn payload_len(&self) -> u32 {
        match self {
            RpcFrameHead::Call { payload_len, .. } | RpcFrameHead::Reply { payload_len, .. } => {
                *payload_len
            }
        }
    }

    fn to_bits(&self) -> Result<u64, RpcError> {
        let mut bits = 0u64;
        match self {
            RpcFrameHead::Call {
                send_id,
                method,
                payload_len,
            } => {
                let method_len = u8::try_from(method.len()).map_err(|_| RpcError::InvalidFrame)?;
                bits.set_bits(TAG_BITS, TAG_CALL);
                bits.set_bits(METHOD_LEN_BITS, method_len as u64);
                bits.set_bits(SEND_ID_BITS, *send_id as u64);
                bits.set_bits(PAYLOAD_LEN_BITS, *payload_len as u64);
            }
            RpcFrameHead::Reply {
                send_id,
                status,
                payload_len,
            } => {
                bits.set_bits(TAG_BITS, TAG_REPLY);
                bits.set_bits(STATUS_BITS, u8::from(*status) as u64);
                bits.set_bits(SEND_ID_BITS, *send_id as u64);
                bits.set_bits(PAYLOAD_LEN_BITS, *payload_len as u64);
            }
        }
        Ok(bits)
    }
}

pub async fn write_frame_head(
    mut write: impl futures_util::AsyncWrite + Unpin,
    frame: &RpcFrameHead,
) -> Result<(), RpcError> {
    let bits = frame.to_bits()?;
    write.write_all(bits.to_be_bytes().as_slice()).await?;
    if let RpcFrameHead::Call { method, .. } = frame {
        write.write_all(method.as_bytes()).await?;
    }
    Ok(())
}

/// Reads the next frame head. `None` means the peer closed the stream cleanly
/// between frames.
pub async fn read_frame_head(
    mut read: impl futures_util::AsyncRead + Unpin,
) -> Option<Result<RpcFrameHead, RpcError>> {
    let mut bits = [0u8; 8];
    // only an EOF before the first byte is clean
    match read.read(&mut bits[..1]).await {
        Ok(0) => return None,
        Ok(_) => {}
        Err(err) => return Some(Err(err.into())),
    }
    if let Err(err) = read.read_exact(&mut bits[1..]).await {
        return Some(Err(err.into()));
    }
    let bits = u64::from_be_bytes(bits);

    let send_id = bits.get_bits(SEND_ID_BITS) as RpcMsgSendId;
    let payload_len = bits.get_bits(PAYLOAD_LEN_BITS) as u32;
    Some(match bits.get_bits(TAG_BITS) {
        TAG_CALL => {
            let mut method = vec![0u8; bits.get_bits(METHOD_LEN_BITS) as usize];
            match read.read_exact(&mut method).await {
                Ok(()) => String::from_utf8(method)
                    .map_err(|_| RpcError::InvalidFrame)
                    .map(|method| RpcFrameHead::Call {
                        send_id,
                        method,
                        payload_len,
                    }),
                Err(err) => Err(err.into()),
            }
        }
        TAG_REPLY => (bits.get_bits(STATUS_BITS) as u8)
            .try_into()
            .map(|status| RpcFrameHead::Reply {
                send_id,
                status,
                payload_len,
            }),
        _ => Err(RpcError::InvalidFrame),
    })
}

pub mod channel;
pub mod formats;
mod frame;
pub mod power;
pub mod server;
pub mod tokio;

extern crate self as bridge_rpc;

pub use bridge_rpc_macro as macros;

pub use crate::channel::{ChannelBuilder, ClientConfig, RpcChannel};
pub use crate::frame::{ReplyStatus, RpcFrame, RpcFrameHead, RpcMsgSendId};
pub use crate::server::{
    BoundServer, ConnectionHandler, MethodTable, RpcServer, ServerConfig, ServerHandle,
};
use crate::frame::{read_frame_head, write_frame_head};
use bytes::BytesMut;
use derive_more::{Display, Error, From};
use futures_util::{AsyncReadExt, AsyncWriteExt, Sink, StreamExt, TryStream};
use std::fmt::Debug;
pub use bridge_rpc_macro::rpc_service;

pub type RpcResult<T> = Result<T, RpcError>;

/// Default upper bound for a frame payload, 16 MiB.
pub const DEFAULT_MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Describes one operation of a service contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcMethodInfo {
    /// Name the operation is registered and dispatched under.
    pub name: &'static str,
    pub request: &'static str,
    pub response: &'static str,
}

/// Static description of a service contract, generated by [`rpc_service`].
pub trait RpcServiceSchema: Clone + Send + Sync + 'static {
    const NAME: &'static str;
    const METHODS: &'static [RpcMethodInfo];

    fn method(name: &str) -> Option<&'static RpcMethodInfo> {
        Self::METHODS.iter().find(|method| method.name == name)
    }
}

impl RpcServiceSchema for () {
    const NAME: &'static str = "";
    const METHODS: &'static [RpcMethodInfo] = &[];
}

/// Wraps a contract implementation so it can be registered with a server.
pub struct RpcServiceWrapper<T> {
    pub service: T,
}

impl<T> RpcServiceWrapper<T> {
    pub fn new(service: T) -> Self {
        Self { service }
    }
}

/// Inserts one handler per operation of contract `S` into a [`MethodTable`].
pub trait RegisterService<S: RpcServiceSchema> {
    fn register<SF: formats::SerdeFormat>(self, table: &mut MethodTable<SF>);
}

/// Failure raised by a service implementation itself.
#[derive(Error, Display, Debug, Clone, PartialEq, Eq)]
#[display("{message}")]
pub struct InvocationError {
    message: String,
}

impl InvocationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

#[derive(Error, From, Display, Debug)]
pub enum RpcError {
    #[from]
    #[display("io error: {_0}")]
    Io(std::io::Error),
    #[display("serialization error: {_0}")]
    SerdeError(std::io::Error),
    #[display("invalid frame")]
    InvalidFrame,
    #[display("unimplemented method: {method}")]
    Unimplemented { method: String },
    #[display("bad request: {message}")]
    BadRequest { message: String },
    #[from]
    #[display("invocation failed: {_0}")]
    Invocation(InvocationError),
    #[display("channel closed")]
    ChannelClosed,
    #[display("call timed out")]
    Timeout,
    #[display("too many calls in flight")]
    TooManyCalls,
}

impl RpcError {
    /// True when the call could not be completed, as opposed to the service
    /// having run and failed.
    pub fn is_transport(&self) -> bool {
        !matches!(self, RpcError::Invocation(_))
    }
}

pub trait RpcTransportStream:
    TryStream<Ok = RpcFrame, Error: Into<RpcError> + Debug + Send + Sync + 'static> + Send + 'static
{
}

impl<S> RpcTransportStream for S where
    S: ?Sized
        + TryStream<Ok = RpcFrame, Error: Into<RpcError> + Debug + Send + Sync + 'static>
        + Send
        + 'static
{
}

pub trait RpcTransportSink:
    Sink<RpcFrame, Error: Into<RpcError> + Debug + Send + Sync + 'static> + Send + 'static
{
}

impl<S> RpcTransportSink for S where
    S: ?Sized + Sink<RpcFrame, Error: Into<RpcError> + Debug + Send + Sync + 'static> + Send + 'static
{
}

/// Splits `read` into frames. A head announcing more than `max_frame_len`
/// payload bytes fails with [`RpcError::InvalidFrame`] before anything is
/// allocated for it.
pub fn new_transport_stream(
    read: impl futures_util::AsyncRead + Unpin + Send + 'static,
    max_frame_len: u32,
) -> impl RpcTransportStream<Error = RpcError> + Unpin {
    let buf = BytesMut::with_capacity(1024 * 8);
    futures_util::stream::unfold((read, buf), move |(mut read, mut buf)| async move {
        let frame_head = match read_frame_head(&mut read).await? {
            Ok(frame_head) => frame_head,
            Err(err) => return Some((Err(err), (read, buf))),
        };
        if frame_head.payload_len() > max_frame_len {
            return Some((Err(RpcError::InvalidFrame), (read, buf)));
        }
        let payload_len = frame_head.payload_len() as usize;
        buf.resize(payload_len, 0);
        match read.read_exact(&mut buf[..payload_len]).await {
            Ok(()) => {
                let payload = buf.split().freeze();
                Some((
                    Ok(RpcFrame {
                        head: frame_head,
                        payload,
                    }),
                    (read, buf),
                ))
            }
            Err(err) => Some((Err(err.into()), (read, buf))),
        }
    })
    .boxed()
}

pub fn new_transport_sink(
    write: impl futures_util::AsyncWrite + Unpin + Send + 'static,
) -> impl RpcTransportSink<Error = RpcError> + Unpin {
    Box::pin(futures_util::sink::unfold(
        write,
        |mut write, frame: RpcFrame| async move {
            write_frame_head(&mut write, &frame.head).await?;
            write.write_all(&frame.payload).await?;
            write.flush().await?;
            Ok::<_, RpcError>(write)
        },
    ))
}

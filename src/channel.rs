use crate::formats::SerdeFormat;
use crate::frame::{ReplyStatus, RpcFrame, RpcFrameHead, RpcMsgSendId};
use crate::{
    DEFAULT_MAX_FRAME_LEN, InvocationError, RpcError, RpcServiceSchema, RpcTransportSink, RpcTransportStream,
    new_transport_sink, new_transport_stream,
};
use bytes::{BufMut, Bytes, BytesMut};
use futures_util::{SinkExt, TryStreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Upper bound for a single call, `None` waits indefinitely.
    pub call_timeout: Option<Duration>,
    pub connect_timeout: Duration,
    /// Largest payload accepted from or sent to the peer.
    pub max_frame_len: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            call_timeout: Some(Duration::from_secs(30)),
            connect_timeout: Duration::from_secs(5),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

pub struct ChannelBuilder<SF, CS = ()> {
    serde_format: SF,
    config: ClientConfig,
    _marker: PhantomData<CS>,
}

impl<SF: SerdeFormat, CS> Clone for ChannelBuilder<SF, CS> {
    fn clone(&self) -> Self {
        Self {
            serde_format: self.serde_format.clone(),
            config: self.config.clone(),
            _marker: PhantomData,
        }
    }
}

impl<SF> ChannelBuilder<SF>
where
    SF: SerdeFormat,
{
    pub fn new(serde_format: SF) -> ChannelBuilder<SF> {
        Self {
            serde_format,
            config: ClientConfig::default(),
            _marker: PhantomData,
        }
    }
}

impl<SF, CS> ChannelBuilder<SF, CS>
where
    SF: SerdeFormat,
{
    /// Types the channel with the contract it will call.
    pub fn schema<S: RpcServiceSchema>(self) -> ChannelBuilder<SF, S> {
        ChannelBuilder {
            serde_format: self.serde_format,
            config: self.config,
            _marker: PhantomData,
        }
    }

    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_call_timeout(mut self, call_timeout: Option<Duration>) -> Self {
        self.config.call_timeout = call_timeout;
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn build_from_read_write(
        self,
        (read, write): (
            impl futures_util::AsyncRead + Unpin + Send + 'static,
            impl futures_util::AsyncWrite + Unpin + Send + 'static,
        ),
    ) -> (
        RpcChannel<SF, CS>,
        impl Future<Output = Result<(), RpcError>> + Send + 'static,
    )
    where
        CS: RpcServiceSchema,
    {
        let stream = new_transport_stream(read, self.config.max_frame_len);
        let sink = new_transport_sink(write);
        self.build_from_transport(sink, stream)
    }

    pub fn build_from_transport(
        self,
        transport_sink: impl RpcTransportSink + Unpin,
        transport_stream: impl RpcTransportStream + Unpin,
    ) -> (
        RpcChannel<SF, CS>,
        impl Future<Output = Result<(), RpcError>> + Send + 'static,
    )
    where
        CS: RpcServiceSchema,
    {
        RpcChannel::new(
            transport_sink,
            transport_stream,
            self.serde_format,
            self.config,
        )
    }
}

enum ChannelCommand {
    Call {
        method: String,
        payload: Bytes,
        return_sender: futures_channel::oneshot::Sender<Result<Bytes, RpcError>>,
    },
    Close,
}

/// Client side of a connection. Cheap to clone; every clone shares the same
/// connection driver.
pub struct RpcChannel<SF, CS: RpcServiceSchema = ()> {
    command_sender: flume::Sender<ChannelCommand>,
    serde_format: SF,
    call_timeout: Option<Duration>,
    max_frame_len: u32,
    _marker: PhantomData<CS>,
}

impl<SF, CS: RpcServiceSchema> Clone for RpcChannel<SF, CS>
where
    SF: SerdeFormat,
{
    fn clone(&self) -> Self {
        Self {
            command_sender: self.command_sender.clone(),
            serde_format: self.serde_format.clone(),
            call_timeout: self.call_timeout,
            max_frame_len: self.max_frame_len,
            _marker: PhantomData,
        }
    }
}

impl<SF: SerdeFormat, CS: RpcServiceSchema> RpcChannel<SF, CS> {
    /// Returns the channel and the future driving the connection. The driver
    /// must be polled (usually spawned) for calls to make progress.
    pub fn new(
        mut transport_sink: impl RpcTransportSink + Unpin,
        mut transport_stream: impl RpcTransportStream + Unpin,
        serde_format: SF,
        config: ClientConfig,
    ) -> (
        Self,
        impl Future<Output = Result<(), RpcError>> + Send + 'static,
    ) {
        let (command_sender, command_receiver) = flume::unbounded();
        let channel = Self {
            command_sender,
            serde_format,
            call_timeout: config.call_timeout,
            max_frame_len: config.max_frame_len,
            _marker: PhantomData,
        };

        (channel, async move {
            let mut calls: HashMap<
                RpcMsgSendId,
                futures_channel::oneshot::Sender<Result<Bytes, RpcError>>,
            > = HashMap::default();
            let mut next_send_id: RpcMsgSendId = 0;
            loop {
                tokio::select! {
                    frame = transport_stream.try_next() => {
                        let Some(frame) = frame.map_err(Into::<RpcError>::into)? else {
                            debug!(service = CS::NAME, "transport stream ended");
                            break;
                        };
                        match frame.head {
                            RpcFrameHead::Call { method, .. } => {
                                warn!(%method, "unexpected call frame.");
                            }
                            RpcFrameHead::Reply { send_id, status, .. } => {
                                let Some(return_sender) = calls.remove(&send_id) else {
                                    warn!(send_id, "unexpected reply frame.");
                                    continue;
                                };
                                // err when the caller gave up
                                let _ = return_sender.send(decode_reply(status, frame.payload));
                            }
                        }
                    }
                    command = command_receiver.recv_async() => {
                        let Ok(ChannelCommand::Call { method, payload, return_sender }) = command else {
                            debug!(service = CS::NAME, "channel closed");
                            break;
                        };
                        // ids stay taken until their reply arrives, even when the caller gave up
                        let Some(send_id) = allocate_send_id(&mut next_send_id, &calls) else {
                            warn!(%method, in_flight = calls.len(), "no free send id");
                            let _ = return_sender.send(Err(RpcError::TooManyCalls));
                            continue;
                        };
                        debug!(%method, send_id, "rpc call");
                        calls.insert(send_id, return_sender);
                        // length checked when the call was prepared
                        let payload_len = payload.len() as u32;
                        transport_sink
                            .send(RpcFrame {
                                head: RpcFrameHead::Call { send_id, method, payload_len },
                                payload,
                            })
                            .await
                            .map_err(Into::<RpcError>::into)?;
                    }
                }
            }
            Ok::<(), RpcError>(())
        })
    }

    /// Performs one remote call of `method`. Fails with a transport error when
    /// the call could not be completed and with [`RpcError::Invocation`] when
    /// the remote implementation failed.
    pub fn call<M, R>(
        &self,
        method: &str,
        msg: &M,
    ) -> impl Future<Output = Result<R, RpcError>> + Send + 'static + use<SF, CS, M, R>
    where
        M: ?Sized + Serialize,
        R: DeserializeOwned + Send + 'static,
    {
        let return_receiver: Result<_, RpcError> = (|| {
            let mut writer = BytesMut::new().writer();
            self.serde_format
                .serialize_to_writer(&mut writer, msg)
                .map_err(RpcError::SerdeError)?;
            let payload = writer.into_inner().freeze();
            let fits = u32::try_from(payload.len()).is_ok_and(|len| len <= self.max_frame_len);
            if !fits || method.len() > u8::MAX as usize {
                return Err(RpcError::InvalidFrame);
            }
            let (return_sender, return_receiver) = futures_channel::oneshot::channel();
            self.command_sender
                .send(ChannelCommand::Call {
                    method: method.to_owned(),
                    payload,
                    return_sender,
                })
                .map_err(|_| RpcError::ChannelClosed)?;
            Ok(return_receiver)
        })();
        let serde_format = self.serde_format.clone();
        let call_timeout = self.call_timeout;
        async move {
            let return_receiver = return_receiver?;
            let reply = match call_timeout {
                Some(call_timeout) => tokio::time::timeout(call_timeout, return_receiver)
                    .await
                    .map_err(|_elapsed| RpcError::Timeout)?,
                None => return_receiver.await,
            };
            let payload = reply.map_err(|_canceled| RpcError::ChannelClosed)??;
            serde_format
                .deserialize_from_slice::<R>(payload.as_ref())
                .map_err(RpcError::SerdeError)
        }
    }

    /// Stops the connection driver. Pending and later calls on every clone
    /// resolve to [`RpcError::ChannelClosed`].
    pub fn close(&self) {
        // already gone when the driver has ended
        let _ = self.command_sender.send(ChannelCommand::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.command_sender.is_disconnected()
    }
}

/// Next send id not held by an outstanding call, `None` when every id is taken.
fn allocate_send_id<T>(
    next_send_id: &mut RpcMsgSendId,
    calls: &HashMap<RpcMsgSendId, T>,
) -> Option<RpcMsgSendId> {
    if calls.len() > RpcMsgSendId::MAX as usize {
        return None;
    }
    loop {
        let send_id = *next_send_id;
        *next_send_id = next_send_id.wrapping_add(1);
        if !calls.contains_key(&send_id) {
            return Some(send_id);
        }
    }
}

fn decode_reply(status: ReplyStatus, payload: Bytes) -> Result<Bytes, RpcError> {
    let message = |payload: &Bytes| String::from_utf8_lossy(payload).into_owned();
    match status {
        ReplyStatus::Ok => Ok(payload),
        ReplyStatus::Unimplemented => Err(RpcError::Unimplemented {
            method: message(&payload),
        }),
        ReplyStatus::InvocationFailed => Err(InvocationError::new(message(&payload)).into()),
        ReplyStatus::BadRequest => Err(RpcError::BadRequest {
            message: message(&payload),
        }),
        ReplyStatus::SerdeFailed => Err(RpcError::SerdeError(std::io::Error::other(message(
            &payload,
        )))),
        ReplyStatus::TransportFailed => Err(RpcError::Io(std::io::Error::other(message(&payload)))),
    }
}

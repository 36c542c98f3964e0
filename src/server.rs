use crate::formats::SerdeFormat;
use crate::frame::{ReplyStatus, RpcFrame, RpcFrameHead};
use crate::{
    DEFAULT_MAX_FRAME_LEN, RegisterService, RpcError, RpcServiceSchema, RpcTransportSink, RpcTransportStream,
    new_transport_sink, new_transport_stream,
};
use bytes::{BufMut, Bytes, BytesMut};
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, SinkExt, TryStreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::compat::{TokioAsyncReadCompatExt, TokioAsyncWriteCompatExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Maximum number of calls executed at the same time across all
    /// connections.
    pub worker_pool_size: usize,
    /// Largest call payload accepted from a client.
    pub max_frame_len: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let worker_pool_size = std::thread::available_parallelism()
            .map(|n| n.get() + 4)
            .unwrap_or(8)
            .min(32);
        Self {
            worker_pool_size,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

type MethodHandler = Arc<dyn Fn(Bytes) -> BoxFuture<'static, Result<Bytes, RpcError>> + Send + Sync>;

/// Maps operation names to type-erased handlers. Payloads are decoded and
/// replies encoded with the table's format.
pub struct MethodTable<SF> {
    serde_format: SF,
    handlers: HashMap<&'static str, MethodHandler>,
}

impl<SF: SerdeFormat> MethodTable<SF> {
    pub fn new(serde_format: SF) -> Self {
        Self {
            serde_format,
            handlers: HashMap::new(),
        }
    }

    pub fn insert<Req, Rep, F, Fut>(&mut self, method: &'static str, handler: F) -> &mut Self
    where
        Req: DeserializeOwned + Send + 'static,
        Rep: Serialize + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Rep, RpcError>> + Send + 'static,
    {
        let serde_format = self.serde_format.clone();
        let handler: MethodHandler = Arc::new(move |payload: Bytes| {
            let call = serde_format
                .deserialize_from_slice::<Req>(payload.as_ref())
                .map(&handler);
            let serde_format = serde_format.clone();
            async move {
                let reply = call
                    .map_err(|err| RpcError::BadRequest {
                        message: err.to_string(),
                    })?
                    .await?;
                let mut writer = BytesMut::new().writer();
                serde_format
                    .serialize_to_writer(&mut writer, &reply)
                    .map_err(RpcError::SerdeError)?;
                Ok::<_, RpcError>(writer.into_inner().freeze())
            }
            .boxed()
        });
        if self.handlers.insert(method, handler).is_some() {
            warn!(method, "replaced existing handler");
        }
        self
    }

    pub fn contains(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    pub fn methods(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.handlers.keys().copied()
    }

    /// Runs the handler registered under `method` on a serialized request.
    pub fn dispatch(&self, method: &str, payload: Bytes) -> BoxFuture<'static, Result<Bytes, RpcError>> {
        match self.handlers.get(method) {
            Some(handler) => handler(payload),
            None => futures_util::future::ready(Err(RpcError::Unimplemented {
                method: method.to_owned(),
            }))
            .boxed(),
        }
    }
}

pub struct RpcServer<SF> {
    table: MethodTable<SF>,
    config: ServerConfig,
}

impl<SF: SerdeFormat> RpcServer<SF> {
    pub fn new(serde_format: SF) -> Self {
        Self {
            table: MethodTable::new(serde_format),
            config: ServerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn add_service<S: RpcServiceSchema>(mut self, service: impl RegisterService<S>) -> Self {
        debug!(service = S::NAME, methods = S::METHODS.len(), "registering service");
        service.register(&mut self.table);
        self
    }

    pub fn method_table(&self) -> &MethodTable<SF> {
        &self.table
    }

    pub fn into_connection_handler(self) -> ConnectionHandler<SF> {
        ConnectionHandler {
            table: Arc::new(self.table),
            workers: Arc::new(Semaphore::new(self.config.worker_pool_size.max(1))),
            shutdown: CancellationToken::new(),
            max_frame_len: self.config.max_frame_len,
        }
    }

    pub async fn bind(self, addr: impl ToSocketAddrs) -> Result<BoundServer<SF>, RpcError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, workers = self.config.worker_pool_size, "rpc server bound");
        Ok(BoundServer {
            listener,
            local_addr,
            handler: self.into_connection_handler(),
        })
    }
}

/// A server holding its listening socket, not yet accepting connections.
pub struct BoundServer<SF> {
    listener: TcpListener,
    local_addr: SocketAddr,
    handler: ConnectionHandler<SF>,
}

impl<SF: SerdeFormat> BoundServer<SF> {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Spawns the accept loop on the current runtime.
    pub fn start(self) -> ServerHandle {
        let shutdown = self.handler.shutdown.clone();
        let task = tokio::spawn(accept_loop(self.listener, self.handler));
        ServerHandle {
            local_addr: self.local_addr,
            shutdown,
            task,
        }
    }
}

async fn accept_loop<SF: SerdeFormat>(listener: TcpListener, handler: ConnectionHandler<SF>) {
    loop {
        tokio::select! {
            () = handler.shutdown.cancelled() => {
                info!("rpc server shutting down");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!(?err, "accept failed");
                        continue;
                    }
                };
                if let Err(err) = stream.set_nodelay(true) {
                    debug!(%peer, ?err, "set_nodelay failed");
                }
                debug!(%peer, "accepted connection");
                let connection = handler.serve_tokio(stream);
                tokio::spawn(async move {
                    match connection.await {
                        Ok(()) => debug!(%peer, "connection closed"),
                        Err(err) => warn!(%peer, ?err, "connection ended with error"),
                    }
                });
            }
        }
    }
}

pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Stops accepting, cancels every open connection and waits for the accept
    /// loop to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(err) = self.task.await {
            warn!(?err, "accept loop panicked");
        }
    }
}

/// Serves calls arriving on individual connections. Clones share the method
/// table and the worker pool.
pub struct ConnectionHandler<SF> {
    table: Arc<MethodTable<SF>>,
    workers: Arc<Semaphore>,
    shutdown: CancellationToken,
    max_frame_len: u32,
}

impl<SF> Clone for ConnectionHandler<SF> {
    fn clone(&self) -> Self {
        Self {
            table: self.table.clone(),
            workers: self.workers.clone(),
            shutdown: self.shutdown.clone(),
            max_frame_len: self.max_frame_len,
        }
    }
}

impl<SF: SerdeFormat> ConnectionHandler<SF> {
    pub fn serve_tokio<IO>(
        &self,
        io: IO,
    ) -> impl Future<Output = Result<(), RpcError>> + Send + 'static + use<SF, IO>
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (read, write) = tokio::io::split(io);
        let stream = new_transport_stream(read.compat(), self.max_frame_len);
        let sink = new_transport_sink(write.compat_write());
        let handler = self.clone();
        async move { handler.serve_transport(sink, stream).await }
    }

    /// Reads calls until the peer goes away, running each one on a worker from
    /// the pool. Calls still running when the connection ends are abandoned.
    pub async fn serve_transport(
        &self,
        mut transport_sink: impl RpcTransportSink + Unpin,
        mut transport_stream: impl RpcTransportStream + Unpin,
    ) -> Result<(), RpcError> {
        let connection = self.shutdown.child_token();
        let (reply_sender, reply_receiver) = flume::unbounded::<RpcFrame>();

        let writer = tokio::spawn({
            let connection = connection.clone();
            async move {
                while let Ok(frame) = reply_receiver.recv_async().await {
                    if let Err(err) = transport_sink.send(frame).await {
                        connection.cancel();
                        return Err(err.into());
                    }
                }
                Ok::<(), RpcError>(())
            }
        });

        let read_result = 'read: loop {
            let frame = tokio::select! {
                () = connection.cancelled() => break 'read Ok(()),
                frame = transport_stream.try_next() => frame,
            };
            let frame = match frame.map_err(Into::<RpcError>::into) {
                Ok(Some(frame)) => frame,
                Ok(None) => break 'read Ok(()),
                Err(err) => break 'read Err(err),
            };
            let (send_id, method) = match frame.head {
                RpcFrameHead::Call {
                    send_id, method, ..
                } => (send_id, method),
                RpcFrameHead::Reply { send_id, .. } => {
                    warn!(send_id, "unexpected reply frame.");
                    continue;
                }
            };
            let permit = tokio::select! {
                () = connection.cancelled() => break 'read Ok(()),
                permit = self.workers.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_closed) => break 'read Ok(()),
                },
            };
            debug!(%method, send_id, "dispatching call");
            let call = self.table.dispatch(&method, frame.payload);
            let reply_sender = reply_sender.clone();
            let connection = connection.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let result = tokio::select! {
                    () = connection.cancelled() => {
                        debug!(%method, send_id, "call abandoned");
                        return;
                    }
                    result = call => result,
                };
                let (status, payload) = encode_reply(result);
                let Ok(payload_len) = u32::try_from(payload.len()) else {
                    warn!(%method, send_id, "reply too large");
                    return;
                };
                let frame = RpcFrame {
                    head: RpcFrameHead::Reply {
                        send_id,
                        status,
                        payload_len,
                    },
                    payload,
                };
                if reply_sender.send(frame).is_err() {
                    debug!(%method, send_id, "reply dropped, connection gone");
                }
            });
        };

        connection.cancel();
        drop(reply_sender);
        let write_result = writer
            .await
            .unwrap_or_else(|err| Err(RpcError::Io(std::io::Error::other(err))));
        read_result.and(write_result)
    }
}

fn encode_reply(result: Result<Bytes, RpcError>) -> (ReplyStatus, Bytes) {
    match result {
        Ok(payload) => (ReplyStatus::Ok, payload),
        Err(RpcError::Unimplemented { method }) => (ReplyStatus::Unimplemented, method.into()),
        Err(RpcError::BadRequest { message }) => (ReplyStatus::BadRequest, message.into()),
        Err(RpcError::Invocation(err)) => {
            (ReplyStatus::InvocationFailed, err.message().to_owned().into())
        }
        Err(RpcError::SerdeError(err)) => (ReplyStatus::SerdeFailed, err.to_string().into()),
        Err(err) => (ReplyStatus::TransportFailed, err.to_string().into()),
    }
}

use crate::formats::SerdeFormat;
use crate::{ChannelBuilder, RpcChannel, RpcError, RpcServiceSchema};
use std::future::Future;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::task::JoinHandle;
use tokio_util::compat::{TokioAsyncReadCompatExt, TokioAsyncWriteCompatExt};
use tracing::{debug, warn};

pub trait ChannelBuilderTokioExt<SF, CS> {
    fn build_from_tokio(
        self,
        io: impl AsyncRead + AsyncWrite + Unpin + Send + 'static,
    ) -> (
        RpcChannel<SF, CS>,
        impl Future<Output = Result<(), RpcError>> + Send + 'static,
    )
    where
        CS: RpcServiceSchema;

    fn build_from_tokio_read_write(
        self,
        io: (
            impl AsyncRead + Unpin + Send + 'static,
            impl AsyncWrite + Unpin + Send + 'static,
        ),
    ) -> (
        RpcChannel<SF, CS>,
        impl Future<Output = Result<(), RpcError>> + Send + 'static,
    )
    where
        CS: RpcServiceSchema;
}

impl<SF, CS> ChannelBuilderTokioExt<SF, CS> for ChannelBuilder<SF, CS>
where
    SF: SerdeFormat,
{
    fn build_from_tokio(
        self,
        io: impl AsyncRead + AsyncWrite + Unpin + Send + 'static,
    ) -> (
        RpcChannel<SF, CS>,
        impl Future<Output = Result<(), RpcError>> + Send + 'static,
    )
    where
        CS: RpcServiceSchema,
    {
        self.build_from_tokio_read_write(tokio::io::split(io))
    }

    fn build_from_tokio_read_write(
        self,
        (read, write): (
            impl AsyncRead + Unpin + Send + 'static,
            impl AsyncWrite + Unpin + Send + 'static,
        ),
    ) -> (
        RpcChannel<SF, CS>,
        impl Future<Output = Result<(), RpcError>> + Send + 'static,
    )
    where
        CS: RpcServiceSchema,
    {
        self.build_from_read_write((read.compat(), write.compat_write()))
    }
}

/// Connects to `addr` and spawns the connection driver on the current runtime.
///
/// Fails with [`RpcError::Io`] when the server is unreachable and with
/// [`RpcError::Timeout`] when the connect timeout elapses first.
pub async fn connect<SF, CS>(
    addr: impl ToSocketAddrs,
    builder: ChannelBuilder<SF, CS>,
) -> Result<(RpcChannel<SF, CS>, JoinHandle<Result<(), RpcError>>), RpcError>
where
    SF: SerdeFormat,
    CS: RpcServiceSchema,
{
    let connect_timeout = builder.config().connect_timeout;
    let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_elapsed| RpcError::Timeout)??;
    stream.set_nodelay(true)?;
    debug!(peer = ?stream.peer_addr().ok(), service = CS::NAME, "connected");
    let (channel, driver) = builder.build_from_tokio(stream);
    let task = tokio::spawn(async move {
        let result = driver.await;
        if let Err(err) = &result {
            warn!(?err, "client channel ended with error");
        }
        result
    });
    Ok((channel, task))
}

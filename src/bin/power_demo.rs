use bridge_rpc::formats::{JsonFormat, SerdeFormat};
use bridge_rpc::power::{
    PowerService, Request, SimpleService, SimpleServiceClient, SimpleServiceSchema,
};
use bridge_rpc::{ChannelBuilder, RpcResult, RpcServer, RpcServiceWrapper, ServerConfig};
use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Address the RPC server listens on (port 0 picks a free port)
    #[arg(long, default_value = "127.0.0.1:0")]
    bind: SocketAddr,

    /// Value used for the direct, in-process calls
    #[arg(long, default_value_t = 2, allow_negative_numbers = true)]
    direct_value: i64,

    /// Value used for the calls through the RPC server
    #[arg(long, default_value_t = 3, allow_negative_numbers = true)]
    remote_value: i64,

    /// Maximum number of calls the server runs at once
    #[arg(long)]
    workers: Option<usize>,

    #[arg(long, value_enum, default_value_t = Format::Json)]
    format: Format,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Format {
    Json,
    #[cfg(feature = "format_message_pack")]
    Msgpack,
}

async fn do_call<S: SimpleService>(client: &SimpleServiceClient<S>, value: i64) -> RpcResult<()> {
    let request = Request::from_fields(value);
    let response = client.call_power_of_two(request).await?;
    println!("    powerOfTwo({value}) = {}", response.value());
    let response = client.call_power_of_four(request).await?;
    println!("    powerOfFour({value}) = {}", response.value());
    Ok(())
}

async fn run<SF: SerdeFormat>(serde_format: SF, args: &Args) -> anyhow::Result<()> {
    let service = PowerService;

    println!("calling service directly:");
    do_call(&SimpleServiceClient::new(service), args.direct_value).await?;

    println!("calling service via RPC:");
    let mut config = ServerConfig::default();
    if let Some(workers) = args.workers {
        config.worker_pool_size = workers;
    }
    let server = RpcServer::new(serde_format.clone())
        .with_config(config)
        .add_service(RpcServiceWrapper::new(service))
        .bind(args.bind)
        .await?;
    info!(port = server.port(), "server listening");
    let server = server.start();

    let builder = ChannelBuilder::new(serde_format).schema::<SimpleServiceSchema>();
    let (channel, driver) = bridge_rpc::tokio::connect(server.local_addr(), builder).await?;
    do_call(&SimpleServiceClient::new(channel.clone()), args.remote_value).await?;

    channel.close();
    driver.await??;
    server.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();
    let args = Args::parse();
    match args.format {
        Format::Json => run(JsonFormat, &args).await,
        #[cfg(feature = "format_message_pack")]
        Format::Msgpack => run(bridge_rpc::formats::MessagePackFormat, &args).await,
    }
}

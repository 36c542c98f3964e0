#[cfg(test)]
mod tests {
    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    /// Squares never finish; fourth powers are computed normally.
    #[derive(Default)]
    struct StuckService {
        started: Arc<Notify>,
        abandoned: Arc<AtomicBool>,
    }

    impl SimpleService for StuckService {
        async fn power_of_two(&self, request: Request) -> RpcResult<Response> {
            let _flag = DropFlag(self.abandoned.clone());
            self.started.notify_one();
            std::future::pending::<()>().await;
            Ok(Response::from_fields(request.value()))
        }

        async fn power_of_four(&self, request: Request) -> RpcResult<Response> {
            PowerService.power_of_four(request).await
        }
    }

    /// Squares only complete once `n` of them run at the same time.
    struct GatheringService {
        barrier: Barrier,
    }

    impl SimpleService for GatheringService {
        async fn power_of_two(&self, request: Request) -> RpcResult<Response> {
            self.barrier.wait().await;
            PowerService.power_of_two(request).await
        }

        async fn power_of_four(&self, request: Request) -> RpcResult<Response> {
            PowerService.power_of_four(request).await
        }
    }

    /// Every square waits for a permit on `gate`.
    struct GatedService {
        gate: Arc<Semaphore>,
        arrived: Arc<Notify>,
    }

    impl SimpleService for GatedService {
        async fn power_of_two(&self, request: Request) -> RpcResult<Response> {
            self.arrived.notify_one();
            let _permit = self.gate.acquire().await;
            PowerService.power_of_two(request).await
        }

        async fn power_of_four(&self, request: Request) -> RpcResult<Response> {
            PowerService.power_of_four(request).await
        }
    }

    async fn start_server<T: SimpleService + 'static>(service: T, workers: usize) -> ServerHandle {
        RpcServer::new(JsonFormat)
            .with_config(ServerConfig {
                worker_pool_size: workers,
                ..ServerConfig::default()
            })
            .add_service(RpcServiceWrapper::new(service))
            .bind("127.0.0.1:0")
            .await
            .unwrap()
            .start()
    }

    async fn connect_to(
        server: &ServerHandle,
        builder: ChannelBuilder<JsonFormat, SimpleServiceSchema>,
    ) -> RpcChannel<JsonFormat, SimpleServiceSchema> {
        let (channel, _driver) = connect(server.local_addr(), builder).await.unwrap();
        channel
    }

    fn json_builder() -> ChannelBuilder<JsonFormat, SimpleServiceSchema> {
        ChannelBuilder::new(JsonFormat).schema::<SimpleServiceSchema>()
    }

    #[tokio::test]
    async fn remote_calls_match_direct_calls() {
        let server = start_server(PowerService, 4).await;
        let channel = connect_to(&server, json_builder()).await;
        let local = SimpleServiceClient::new(PowerService);
        let remote = SimpleServiceClient::new(channel);

        let square = remote
            .call_power_of_two(Request::from_fields(5))
            .await
            .unwrap();
        assert_eq!(square, Response::from_fields(25));

        for value in -40..=40 {
            let request = Request::from_fields(value);
            let expected_two = local.call_power_of_two(request).await.unwrap();
            let expected_four = local.call_power_of_four(request).await.unwrap();
            assert_eq!(expected_two.value(), value * value);
            assert_eq!(expected_four.value(), value * value * value * value);
            assert_eq!(remote.call_power_of_two(request).await.unwrap(), expected_two);
            assert_eq!(remote.call_power_of_four(request).await.unwrap(), expected_four);
        }
        server.shutdown().await;
    }

    #[tokio::test]
    async fn repeated_remote_calls_agree() {
        let server = start_server(PowerService, 2).await;
        let channel = connect_to(&server, json_builder()).await;
        let request = Request::from_fields(7);
        let first = channel.power_of_four(request).await.unwrap();
        let second = channel.power_of_four(request).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.value(), 2401);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn overflow_fails_the_same_way_remotely() {
        let server = start_server(PowerService, 2).await;
        let channel = connect_to(&server, json_builder()).await;
        let request = Request::from_fields(1 << 20);

        let local = PowerService.power_of_four(request).await.unwrap_err();
        let remote = channel.power_of_four(request).await.unwrap_err();
        assert!(!remote.is_transport());
        match (local, remote) {
            (RpcError::Invocation(local), RpcError::Invocation(remote)) => {
                assert_eq!(local, remote);
            }
            other => panic!("expected invocation errors, got {other:?}"),
        }
        server.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_method_is_unimplemented() {
        let server = start_server(PowerService, 2).await;
        let channel = connect_to(&server, json_builder()).await;

        let err = channel
            .call::<_, Response>("powerOfEight", &Request::from_fields(2))
            .await
            .unwrap_err();
        assert!(err.is_transport());
        assert!(matches!(err, RpcError::Unimplemented { ref method } if method == "powerOfEight"));

        let response = channel.power_of_two(Request::from_fields(3)).await.unwrap();
        assert_eq!(response.value(), 9);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn malformed_request_is_rejected() {
        let server = start_server(PowerService, 2).await;
        let channel = connect_to(&server, json_builder()).await;

        let err = channel
            .call::<_, Response>(SimpleServiceSchema::POWER_OF_TWO, "not a request")
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::BadRequest { .. }));
        server.shutdown().await;
    }

    #[tokio::test]
    async fn closing_the_channel_resolves_pending_calls() {
        let service = StuckService::default();
        let started = service.started.clone();
        let abandoned = service.abandoned.clone();
        let server = start_server(service, 2).await;
        let channel = connect_to(&server, json_builder().with_call_timeout(None)).await;

        let pending = tokio::spawn({
            let channel = channel.clone();
            async move { channel.power_of_two(Request::from_fields(4)).await }
        });
        timeout(Duration::from_secs(5), started.notified())
            .await
            .expect("call never reached the server");

        channel.close();
        let result = timeout(Duration::from_secs(5), pending)
            .await
            .expect("pending call hung after close")
            .unwrap();
        assert!(matches!(result, Err(RpcError::ChannelClosed)));

        let err = channel
            .power_of_four(Request::from_fields(2))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::ChannelClosed));
        assert!(channel.is_closed());

        timeout(Duration::from_secs(5), async {
            while !abandoned.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("server kept running the abandoned call");
        server.shutdown().await;
    }

    #[tokio::test]
    async fn slow_call_times_out() {
        let server = start_server(StuckService::default(), 2).await;
        let builder = json_builder().with_call_timeout(Some(Duration::from_millis(100)));
        let channel = connect_to(&server, builder).await;

        let err = channel
            .power_of_two(Request::from_fields(2))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Timeout));
        assert!(err.is_transport());

        let response = channel.power_of_four(Request::from_fields(2)).await.unwrap();
        assert_eq!(response.value(), 16);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn unreachable_server_is_a_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let Err(err) = connect(addr, json_builder()).await else {
            panic!("connected to a closed port");
        };
        assert!(err.is_transport());
        assert!(matches!(err, RpcError::Io(_)));
    }

    #[tokio::test]
    async fn shut_down_server_refuses_connections() {
        let server = start_server(PowerService, 1).await;
        let addr = server.local_addr();
        server.shutdown().await;

        let Err(err) = connect(addr, json_builder()).await else {
            panic!("connected after shutdown");
        };
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn calls_from_several_clients_run_in_parallel() {
        let service = GatheringService {
            barrier: Barrier::new(4),
        };
        let server = start_server(service, 4).await;
        let first = connect_to(&server, json_builder()).await;
        let second = connect_to(&server, json_builder()).await;

        let calls = try_join_all([
            first.power_of_two(Request::from_fields(1)),
            first.power_of_two(Request::from_fields(2)),
            second.power_of_two(Request::from_fields(3)),
            second.power_of_two(Request::from_fields(4)),
        ]);
        let responses = timeout(Duration::from_secs(5), calls)
            .await
            .expect("calls were not served concurrently")
            .unwrap();
        let values: Vec<_> = responses.iter().map(Response::value).collect();
        assert_eq!(values, [1, 4, 9, 16]);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn late_reply_never_reaches_a_newer_call() {
        let gate = Arc::new(Semaphore::new(0));
        let arrived = Arc::new(Notify::new());
        let service = GatedService {
            gate: gate.clone(),
            arrived: arrived.clone(),
        };
        let server = start_server(service, 8).await;
        let channel = connect_to(&server, json_builder()).await;

        let abandoned = tokio::spawn({
            let channel = channel.clone();
            async move { channel.power_of_two(Request::from_fields(1000)).await }
        });
        timeout(Duration::from_secs(5), arrived.notified())
            .await
            .expect("first call never reached the server");
        abandoned.abort();
        assert!(abandoned.await.unwrap_err().is_cancelled());

        // brings the send id counter back to the abandoned call's id
        for _ in 0..255 {
            let calls = (0..257).map(|_| channel.power_of_four(Request::from_fields(2)));
            let responses = try_join_all(calls).await.unwrap();
            assert!(responses.iter().all(|response| response.value() == 16));
        }

        let current = tokio::spawn({
            let channel = channel.clone();
            async move { channel.power_of_two(Request::from_fields(7)).await }
        });
        timeout(Duration::from_secs(5), arrived.notified())
            .await
            .expect("second call never reached the server");
        gate.add_permits(2);

        let response = timeout(Duration::from_secs(5), current)
            .await
            .expect("second call never resolved")
            .unwrap()
            .unwrap();
        assert_eq!(response.value(), 49);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn oversized_request_is_not_sent() {
        let server = start_server(PowerService, 1).await;
        let config = ClientConfig {
            max_frame_len: 4,
            ..ClientConfig::default()
        };
        let channel = connect_to(&server, json_builder().with_config(config)).await;

        let err = channel
            .power_of_two(Request::from_fields(2))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::InvalidFrame));
        assert!(!channel.is_closed());
        server.shutdown().await;
    }

    #[tokio::test]
    async fn message_pack_over_in_memory_transport() {
        let (client_io, server_io) = tokio::io::duplex(1024 * 8);
        let handler = RpcServer::new(MessagePackFormat)
            .add_service(RpcServiceWrapper::new(PowerService))
            .into_connection_handler();
        let serving = tokio::spawn(handler.serve_tokio(server_io));

        let (channel, driver) = ChannelBuilder::new(MessagePackFormat)
            .schema::<SimpleServiceSchema>()
            .build_from_tokio(client_io);
        let driver = tokio::spawn(driver);

        let client = SimpleServiceClient::new(channel.clone());
        let response = client
            .call_power_of_four(Request::from_fields(3))
            .await
            .unwrap();
        assert_eq!(response, Response::from_fields(81));
        let response = client
            .call_power_of_two(Request::from_fields(-9))
            .await
            .unwrap();
        assert_eq!(response.value(), 81);

        channel.close();
        driver.await.unwrap().unwrap();
        serving.await.unwrap().ok();
    }

    use bridge_rpc::formats::{JsonFormat, MessagePackFormat};
    use bridge_rpc::power::{
        PowerService, Request, Response, SimpleService, SimpleServiceClient, SimpleServiceSchema,
    };
    use bridge_rpc::tokio::{ChannelBuilderTokioExt, connect};
    use bridge_rpc::{
        ChannelBuilder, ClientConfig, RpcChannel, RpcError, RpcResult, RpcServer, RpcServiceWrapper,
        ServerConfig, ServerHandle,
    };
    use futures_util::future::try_join_all;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::sync::{Barrier, Notify, Semaphore};
    use tokio::time::timeout;
}

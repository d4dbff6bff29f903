// SPDX-License-Identifier: Apache-2.0

//! End-to-end scenarios over real loopback sockets: one or more server
//! nodes, driven by client connectors.

use async_trait::async_trait;
use playhouse::{
    packet::codec,
    AccountId,
    Actor,
    ActorSender,
    ApiSender,
    Connector,
    ConnectorConfig,
    ErrorCode,
    Packet,
    PeerConfig,
    PlayServer,
    PlayServerBuilder,
    ServerConfig,
    Stage,
    StageSender,
};
use std::{
    convert::TryInto,
    time::Duration,
};

const API_SERVICE: u16 = 9;

struct TestActor {
    sender: ActorSender,
}

impl Actor for TestActor {}

struct TestStage {
    sender: StageSender<TestStage>,
    counter: u64,
    ticks: u32,
    last_async: u64,
}

impl TestStage {
    fn new(sender: StageSender<TestStage>) -> Self {
        Self {
            sender,
            counter: 0,
            ticks: 0,
            last_async: 0,
        }
    }
}

#[async_trait]
impl Stage for TestStage {
    type Actor = TestActor;

    async fn on_authenticate(&mut self, packet: &Packet) -> Result<AccountId, u16> {
        if packet.payload.len() < 8 {
            return Err(ErrorCode::BadRequest.code());
        }
        Ok(i64::from_le_bytes(packet.payload[..8].try_into().unwrap()))
    }

    async fn on_dispatch(&mut self, actor: &mut TestActor, packet: Packet) {
        match packet.msg_id.as_str() {
            "Echo" => actor.sender.reply(Packet::new("EchoReply", packet.payload)),
            "Broadcast" => self.sender.broadcast_to_actors(Packet::new("News", packet.payload)),
            "SlowEcho" => {
                tokio::time::sleep(Duration::from_millis(400)).await;
                actor.sender.reply(Packet::new("SlowEchoReply", packet.payload));
            }
            "Bump" => {
                // read-modify-write with a suspension point in the middle;
                // lost updates would betray overlapping dispatch
                let value = self.counter;
                tokio::time::sleep(Duration::from_millis(1)).await;
                self.counter = value + 1;
            }
            "GetCount" => actor
                .sender
                .reply(Packet::new("GetCountReply", self.counter.to_le_bytes().to_vec())),
            "GetActors" => {
                let infos = self.sender.actor_infos();
                let connected = infos.iter().filter(|info| info.connected).count();
                actor
                    .sender
                    .reply(Packet::new("GetActorsReply", vec![infos.len() as u8, connected as u8]));
            }
            "StartTimer" => {
                let target = actor.sender.clone();
                self.sender.add_count_timer(
                    Duration::from_millis(50),
                    Duration::from_millis(50),
                    5,
                    move |stage| {
                        stage.ticks += 1;
                        target.send(Packet::new("Tick", vec![stage.ticks as u8]));
                    },
                );
                actor.sender.reply(Packet::new("StartTimerReply", Vec::new()));
            }
            "SendNote" => {
                let mut start = 0;
                let node = codec::read_short_str(&mut start, &packet.payload).unwrap_or_default();
                let stage_id = codec::read_i64(&mut start, &packet.payload).unwrap_or(0);
                self.sender.send_to_stage(&node, stage_id, Packet::new("Note", Vec::new()));
                actor.sender.reply(Packet::new("SendNoteReply", Vec::new()));
            }
            "CrossCount" => {
                let mut start = 0;
                let node = codec::read_short_str(&mut start, &packet.payload).unwrap_or_default();
                let stage_id = codec::read_i64(&mut start, &packet.payload).unwrap_or(0);
                let reply = self
                    .sender
                    .request_to_stage(&node, stage_id, Packet::new("GetCount", Vec::new()))
                    .await;
                actor.sender.reply(Packet::new("CrossCountReply", reply.payload));
            }
            "CrossEcho" => {
                let mut start = 0;
                let node = codec::read_short_str(&mut start, &packet.payload).unwrap_or_default();
                let stage_id = codec::read_i64(&mut start, &packet.payload).unwrap_or(0);
                let inner = packet.payload[start..].to_vec();
                let reply = self
                    .sender
                    .request_to_stage(&node, stage_id, Packet::new("Echo", inner))
                    .await;
                if reply.error_code != 0 {
                    actor.sender.reply_error(reply.error_code);
                } else {
                    actor.sender.reply(Packet::new("CrossEchoReply", reply.payload));
                }
            }
            "AskApi" => {
                let reply = self
                    .sender
                    .request_to_api(API_SERVICE, Packet::new("ApiEcho", packet.payload))
                    .await;
                if reply.error_code != 0 {
                    actor.sender.reply_error(reply.error_code);
                } else {
                    actor.sender.reply(Packet::new("AskApiReply", reply.payload));
                }
            }
            "AskMakeRoom" => {
                let reply = self
                    .sender
                    .request_to_api(API_SERVICE, Packet::new("MakeRoom", packet.payload))
                    .await;
                actor.sender.reply(Packet::new("AskMakeRoomReply", reply.payload));
            }
            "Background" => {
                self.sender.async_block(
                    || async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        42u64
                    },
                    |stage, value| {
                        stage.last_async = value;
                    },
                );
                actor.sender.reply(Packet::new("BackgroundReply", Vec::new()));
            }
            "GetAsync" => actor
                .sender
                .reply(Packet::new("GetAsyncReply", self.last_async.to_le_bytes().to_vec())),
            "Boom" => panic!("handler exploded"),
            "Silent" => {}
            _ => actor.sender.reply_error(ErrorCode::BadRequest.code()),
        }
    }

    async fn on_stage_dispatch(&mut self, packet: Packet) {
        match packet.msg_id.as_str() {
            "Echo" => self.sender.reply(Packet::new("EchoReply", packet.payload)),
            "Note" => self.counter += 1,
            "GetCount" => self
                .sender
                .reply(Packet::new("GetCountReply", self.counter.to_le_bytes().to_vec())),
            _ => {}
        }
    }
}

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn server_cfg(node_id: &str) -> ServerConfig {
    let mut cfg = ServerConfig::new(node_id);
    cfg.client_bind = Some("127.0.0.1:0".parse().unwrap());
    cfg.s2s_bind = Some("127.0.0.1:0".parse().unwrap());
    cfg.default_stage_type = "test".to_string();
    cfg.request_timeout_ms = 2_000;
    cfg
}

async fn start_server(cfg: ServerConfig) -> PlayServer {
    PlayServerBuilder::new(cfg)
        .register_stage::<TestStage, _, _>("test", TestStage::new, |sender| TestActor { sender })
        .register_controller_fn("ApiEcho", |packet: Packet, sender: ApiSender| async move {
            sender.reply(Packet::new("ApiEchoReply", packet.payload));
        })
        .register_controller_fn("MakeRoom", |packet: Packet, sender: ApiSender| async move {
            let node = String::from_utf8(packet.payload.clone()).unwrap_or_default();
            let (code, _) = sender.create_stage(&node, "test", Some(123), Vec::new()).await;
            sender.reply(Packet::new("MakeRoomReply", vec![(code == 0) as u8]));
        })
        .start()
        .await
        .expect("server starts")
}

async fn client(server: &PlayServer) -> Connector {
    client_with(server, ConnectorConfig::default()).await
}

async fn client_with(server: &PlayServer, cfg: ConnectorConfig) -> Connector {
    let addr = server.client_addr().expect("client listener").to_string();
    Connector::connect(cfg, &addr).await.expect("connector connects")
}

async fn authenticate(connector: &Connector, account: i64) {
    connector
        .authenticate(account.to_le_bytes().to_vec())
        .await
        .expect("authentication succeeds");
}

fn cross_payload(node: &str, stage_id: i64, inner: &[u8]) -> Vec<u8> {
    let mut payload = Vec::new();
    codec::write_short_str(&mut payload, node).unwrap();
    codec::write_i64(&mut payload, stage_id);
    payload.extend_from_slice(inner);
    payload
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn echo_round_trip() {
    init_logs();
    let server = start_server(server_cfg("play-1")).await;
    let connector = client(&server).await;
    authenticate(&connector, 1).await;
    let reply = connector.request("Echo", b"hello".to_vec()).await;
    assert_eq!(reply.error_code, 0);
    assert_eq!(reply.msg_id, "EchoReply");
    assert_eq!(reply.payload, b"hello");
    // replies carry the request's sequence; a fresh request gets a fresh one
    let second = connector.request("Echo", b"again".to_vec()).await;
    assert_eq!(second.payload, b"again");
    assert_ne!(second.msg_seq, reply.msg_seq);
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn broadcast_reaches_every_connected_actor() {
    init_logs();
    let server = start_server(server_cfg("play-1")).await;
    let c1 = client(&server).await;
    c1.connect_stage(300, "test").await.unwrap();
    authenticate(&c1, 1).await;
    let mut c1 = c1;
    let c2 = client(&server).await;
    c2.connect_stage(300, "test").await.unwrap();
    authenticate(&c2, 2).await;
    let mut c2 = c2;

    c1.send("Broadcast", b"tick".to_vec());
    for connector in [&mut c1, &mut c2] {
        let push = tokio::time::timeout(Duration::from_secs(2), connector.recv_push())
            .await
            .expect("push arrives")
            .expect("connection open");
        assert_eq!(push.msg_id, "News");
        assert_eq!(push.msg_seq, 0);
        assert_eq!(push.payload, b"tick");
    }
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn request_times_out_and_late_reply_is_dropped() {
    init_logs();
    let server = start_server(server_cfg("play-1")).await;
    let mut cfg = ConnectorConfig::default();
    cfg.request_timeout_ms = 200;
    let mut connector = client_with(&server, cfg).await;
    authenticate(&connector, 1).await;

    let started = std::time::Instant::now();
    let reply = connector.request("SlowEcho", b"late".to_vec()).await;
    let elapsed = started.elapsed();
    assert_eq!(reply.error_code, ErrorCode::Timeout.code());
    assert!(elapsed >= Duration::from_millis(150), "fired after {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(400), "fired after {:?}", elapsed);

    // the server's reply lands ~400ms in and must not surface anywhere
    tokio::time::sleep(Duration::from_millis(400)).await;
    let echo = connector.request("Echo", b"alive".to_vec()).await;
    assert_eq!(echo.payload, b"alive");
    assert!(tokio::time::timeout(Duration::from_millis(100), connector.recv_push())
        .await
        .is_err());
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cross_node_request_and_unreachable_node() {
    init_logs();
    let server_a = start_server(server_cfg("a")).await;
    let server_b = start_server(server_cfg("b")).await;
    server_a.add_peer(PeerConfig {
        node_id: "b".to_string(),
        address: server_b.s2s_addr().unwrap(),
        service_id: None,
    });
    server_b.add_peer(PeerConfig {
        node_id: "a".to_string(),
        address: server_a.s2s_addr().unwrap(),
        service_id: None,
    });
    // a peer with nothing behind it
    server_a.add_peer(PeerConfig {
        node_id: "ghost".to_string(),
        address: "127.0.0.1:1".parse().unwrap(),
        service_id: None,
    });
    server_b.create_stage("test", Some(77), Vec::new()).await.unwrap();

    let connector = client(&server_a).await;
    authenticate(&connector, 1).await;
    let reply = connector
        .request("CrossEcho", cross_payload("b", 77, b"ping"))
        .await;
    assert_eq!(reply.error_code, 0, "cross request failed: {:?}", reply);
    assert_eq!(reply.payload, b"ping");

    // a stage that does not exist on the remote node
    let reply = connector
        .request("CrossEcho", cross_payload("b", 9999, b"ping"))
        .await;
    assert_eq!(reply.error_code, ErrorCode::StageNotFound.code());

    // a node nothing listens for
    let reply = connector
        .request("CrossEcho", cross_payload("ghost", 1, b"ping"))
        .await;
    assert_eq!(reply.error_code, ErrorCode::NodeUnreachable.code());

    server_a.shutdown().await;
    server_b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_login_kicks_the_older_session() {
    init_logs();
    let server = start_server(server_cfg("play-1")).await;
    let c1 = client(&server).await;
    c1.connect_stage(600, "test").await.unwrap();
    authenticate(&c1, 9).await;
    assert_eq!(c1.request("Echo", b"one".to_vec()).await.payload, b"one");

    let c2 = client(&server).await;
    c2.connect_stage(600, "test").await.unwrap();
    authenticate(&c2, 9).await;
    assert_eq!(c2.request("Echo", b"two".to_vec()).await.payload, b"two");

    // the first session gets closed by the server
    let mut kicked = false;
    for _ in 0..200 {
        if !c1.is_connected() {
            kicked = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(kicked, "older session was not disconnected");

    // exactly one live actor remains
    let reply = c2.request("GetActors", Vec::new()).await;
    assert_eq!(reply.payload, vec![1, 1]);
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disconnected_actor_lingers_and_resumes() {
    init_logs();
    let server = start_server(server_cfg("play-1")).await;
    let c1 = client(&server).await;
    c1.connect_stage(700, "test").await.unwrap();
    authenticate(&c1, 5).await;
    c1.disconnect();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let c2 = client(&server).await;
    c2.connect_stage(700, "test").await.unwrap();
    authenticate(&c2, 5).await;
    let reply = c2.request("GetActors", Vec::new()).await;
    // one actor total, connected again after the resume
    assert_eq!(reply.payload, vec![1, 1]);
    assert_eq!(c2.request("Echo", b"back".to_vec()).await.payload, b"back");
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn count_timer_fires_five_ordered_ticks() {
    init_logs();
    let server = start_server(server_cfg("play-1")).await;
    let mut connector = client(&server).await;
    authenticate(&connector, 1).await;
    let reply = connector.request("StartTimer", Vec::new()).await;
    assert_eq!(reply.error_code, 0);
    for expected in 1..=5u8 {
        let push = tokio::time::timeout(Duration::from_secs(2), connector.recv_push())
            .await
            .expect("tick arrives")
            .expect("connection open");
        assert_eq!(push.msg_id, "Tick");
        assert_eq!(push.payload, vec![expected]);
    }
    // no sixth tick
    assert!(tokio::time::timeout(Duration::from_millis(200), connector.recv_push())
        .await
        .is_err());
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_pushes_dispatch_serially() {
    init_logs();
    let server = start_server(server_cfg("play-1")).await;
    let mut clients = Vec::new();
    for account in 1..=3i64 {
        let connector = client(&server).await;
        connector.connect_stage(500, "test").await.unwrap();
        authenticate(&connector, account).await;
        clients.push(connector);
    }
    for connector in &clients {
        for _ in 0..30 {
            connector.send("Bump", Vec::new());
        }
    }
    // the counter reaches 90 only if no read-modify-write interleaved
    let mut observed = 0;
    for _ in 0..100 {
        let reply = clients[0].request("GetCount", Vec::new()).await;
        observed = u64::from_le_bytes(reply.payload[..8].try_into().unwrap());
        if observed == 90 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(observed, 90);
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handler_panic_is_contained() {
    init_logs();
    let server = start_server(server_cfg("play-1")).await;
    let connector = client(&server).await;
    authenticate(&connector, 1).await;
    let reply = connector.request("Boom", Vec::new()).await;
    assert_eq!(reply.error_code, ErrorCode::InternalError.code());
    // the stage keeps dispatching afterwards
    let echo = connector.request("Echo", b"still here".to_vec()).await;
    assert_eq!(echo.payload, b"still here");
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn api_round_trip_and_stage_creation() {
    init_logs();
    let mut cfg = server_cfg("play-1");
    cfg.service_id = Some(API_SERVICE);
    let server = start_server(cfg).await;
    let connector = client(&server).await;
    authenticate(&connector, 1).await;

    let reply = connector.request("AskApi", b"profile".to_vec()).await;
    assert_eq!(reply.error_code, 0, "api request failed: {:?}", reply);
    assert_eq!(reply.payload, b"profile");

    let reply = connector
        .request("AskMakeRoom", server.node_id().as_bytes().to_vec())
        .await;
    assert_eq!(reply.payload, vec![1]);
    let stats = server.stage_stats();
    assert!(stats.iter().any(|s| s.stage_id == 123), "stage 123 missing: {:?}", stats);
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn async_block_posts_back_into_the_loop() {
    init_logs();
    let server = start_server(server_cfg("play-1")).await;
    let connector = client(&server).await;
    authenticate(&connector, 1).await;
    assert_eq!(connector.request("Background", Vec::new()).await.error_code, 0);
    let mut value = 0;
    for _ in 0..100 {
        let reply = connector.request("GetAsync", Vec::new()).await;
        value = u64::from_le_bytes(reply.payload[..8].try_into().unwrap());
        if value == 42 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(value, 42);
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn websocket_transport_round_trip() {
    init_logs();
    let mut cfg = server_cfg("ws-1");
    cfg.use_websocket = true;
    let server = start_server(cfg).await;
    let mut client_cfg = ConnectorConfig::default();
    client_cfg.use_websocket = true;
    let connector = client_with(&server, client_cfg).await;
    authenticate(&connector, 1).await;
    let reply = connector.request("Echo", b"over websocket".to_vec()).await;
    assert_eq!(reply.error_code, 0);
    assert_eq!(reply.payload, b"over websocket");
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unauthenticated_requests_are_refused() {
    init_logs();
    let server = start_server(server_cfg("play-1")).await;
    let connector = client(&server).await;
    let reply = connector.request("Echo", b"nope".to_vec()).await;
    assert_eq!(reply.error_code, ErrorCode::Unauthenticated.code());
    // the session is closed afterwards
    let mut closed = false;
    for _ in 0..200 {
        if !connector.is_connected() {
            closed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(closed);
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wrong_stage_type_is_rejected() {
    init_logs();
    let cfg = server_cfg("play-1");
    let server = PlayServerBuilder::new(cfg)
        .register_stage::<TestStage, _, _>("test", TestStage::new, |sender| TestActor { sender })
        .register_stage::<TestStage, _, _>("other", TestStage::new, |sender| TestActor { sender })
        .start()
        .await
        .unwrap();
    let connector = client(&server).await;
    connector.connect_stage(800, "test").await.unwrap();
    let err = connector.connect_stage(800, "other").await.unwrap_err();
    assert_eq!(err, ErrorCode::WrongStageType.code());
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn large_replies_travel_compressed() {
    init_logs();
    let server = start_server(server_cfg("play-1")).await;
    let connector = client(&server).await;
    authenticate(&connector, 1).await;
    // far above the 4 KiB compression threshold, and highly compressible
    let payload: Vec<u8> = b"state ".iter().cycle().take(96 * 1024).copied().collect();
    let reply = connector.request("Echo", payload.clone()).await;
    assert_eq!(reply.error_code, 0);
    assert_eq!(reply.payload, payload);
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn full_stage_queue_fails_posts_with_overloaded() {
    init_logs();
    let mut cfg = server_cfg("play-1");
    cfg.stage_queue_capacity = 2;
    let server = start_server(cfg).await;
    let connector = client(&server).await;
    authenticate(&connector, 1).await;
    // occupy the worker, then fill the two queue slots behind it
    connector.send("SlowEcho", Vec::new());
    connector.send("Bump", Vec::new());
    connector.send("Bump", Vec::new());
    let reply = connector.request("Echo", b"full".to_vec()).await;
    assert_eq!(reply.error_code, ErrorCode::Overloaded.code());
    // once the queue drains the stage accepts work again
    tokio::time::sleep(Duration::from_millis(600)).await;
    let reply = connector.request("Echo", b"drained".to_vec()).await;
    assert_eq!(reply.payload, b"drained");
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cross_node_pushes_arrive_at_most_once() {
    init_logs();
    let server_a = start_server(server_cfg("a2")).await;
    let server_b = start_server(server_cfg("b2")).await;
    server_a.add_peer(PeerConfig {
        node_id: "b2".to_string(),
        address: server_b.s2s_addr().unwrap(),
        service_id: None,
    });
    server_b.add_peer(PeerConfig {
        node_id: "a2".to_string(),
        address: server_a.s2s_addr().unwrap(),
        service_id: None,
    });
    server_b.create_stage("test", Some(88), Vec::new()).await.unwrap();

    let connector = client(&server_a).await;
    authenticate(&connector, 1).await;
    for _ in 0..3 {
        let ack = connector.request("SendNote", cross_payload("b2", 88, &[])).await;
        assert_eq!(ack.error_code, 0);
    }
    let mut observed = 0;
    for _ in 0..100 {
        let reply = connector.request("CrossCount", cross_payload("b2", 88, &[])).await;
        observed = u64::from_le_bytes(reply.payload[..8].try_into().unwrap());
        if observed == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(observed, 3);
    server_a.shutdown().await;
    server_b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reconnect_resumes_the_same_actor() {
    init_logs();
    let server = start_server(server_cfg("play-1")).await;
    let mut connector = client(&server).await;
    connector.connect_stage(1000, "test").await.unwrap();
    authenticate(&connector, 3).await;
    assert_eq!(connector.request("Echo", b"before".to_vec()).await.payload, b"before");

    connector.reconnect().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    connector.connect_stage(1000, "test").await.unwrap();
    authenticate(&connector, 3).await;
    assert_eq!(connector.request("Echo", b"after".to_vec()).await.payload, b"after");
    // still the one actor, connected again
    let reply = connector.request("GetActors", Vec::new()).await;
    assert_eq!(reply.payload, vec![1, 1]);
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn leave_destroys_the_actor() {
    init_logs();
    let server = start_server(server_cfg("play-1")).await;
    let c1 = client(&server).await;
    c1.connect_stage(900, "test").await.unwrap();
    authenticate(&c1, 1).await;
    let c2 = client(&server).await;
    c2.connect_stage(900, "test").await.unwrap();
    authenticate(&c2, 2).await;

    let reply = c1.request(playhouse::MSG_LEAVE_STAGE, Vec::new()).await;
    assert_eq!(reply.error_code, 0);
    let reply = c2.request("GetActors", Vec::new()).await;
    assert_eq!(reply.payload, vec![1, 1]);
    server.shutdown().await;
}

// SPDX-License-Identifier: Apache-2.0

//! Server bootstrap: the shared [`Runtime`] state bundle and the
//! [`PlayServer`] builder wiring listeners, stage factories, and Api
//! controllers together.
//!
//! Nothing here is a process-wide singleton — several servers can coexist
//! in one process (the test rigs rely on it), each with its own runtime.

use crate::{
    api::{
        ApiController,
        ApiHost,
        FnController,
    },
    cluster::{
        listener::run_s2s_listener,
        Cluster,
    },
    config::{
        PeerConfig,
        ServerConfig,
    },
    packet::Packet,
    sender::{
        ActorSender,
        ApiSender,
        StageSender,
    },
    session::{
        spawn_session,
        SessionTable,
    },
    stage::{
        pool::{
            StageFactory,
            StagePool,
            StageStats,
        },
        runner::make_factory,
        Stage,
    },
    timer::TimerService,
    transport,
    NodeId,
    StageId,
};
use anyhow::Context;
use log::{
    debug,
    info,
    warn,
};
use std::{
    future::Future,
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};
use tokio::{
    net::{
        TcpListener,
        TcpSocket,
    },
    task::JoinHandle,
};
use tokio_rustls::TlsAcceptor;

/// The shared state of one server process: configuration plus every
/// registry the routing plane derefs through.
pub(crate) struct Runtime {
    pub cfg: ServerConfig,
    pub node_id: NodeId,
    pub stages: StagePool,
    pub sessions: SessionTable,
    pub timers: Arc<TimerService>,
    pub cluster: Cluster,
    pub api: ApiHost,
}

/// Builder collecting stage types and controllers before start.
pub struct PlayServerBuilder {
    cfg: ServerConfig,
    factories: Vec<(String, StageFactory)>,
    controllers: Vec<(String, Box<dyn ApiController>)>,
}

impl PlayServerBuilder {
    /// Start building a server from its configuration.
    pub fn new(cfg: ServerConfig) -> Self {
        Self {
            cfg,
            factories: Vec::new(),
            controllers: Vec::new(),
        }
    }

    /// Register a stage type with its stage and actor builders.
    pub fn register_stage<S, FS, FA>(mut self, stage_type: &str, stage_builder: FS, actor_builder: FA) -> Self
    where
        S: Stage,
        FS: Fn(StageSender<S>) -> S + Send + Sync + 'static,
        FA: Fn(ActorSender) -> S::Actor + Send + Sync + 'static,
    {
        self.factories
            .push((stage_type.to_string(), make_factory(stage_builder, actor_builder)));
        self
    }

    /// Register an Api controller under a msg id.
    pub fn register_controller(mut self, msg_id: &str, controller: Box<dyn ApiController>) -> Self {
        self.controllers.push((msg_id.to_string(), controller));
        self
    }

    /// Register an async closure as an Api controller.
    pub fn register_controller_fn<F, Fut>(self, msg_id: &str, handler: F) -> Self
    where
        F: Fn(Packet, ApiSender) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.register_controller(msg_id, Box::new(FnController::new(handler)))
    }

    /// Bind the configured listeners and bring the node up.
    pub async fn start(self) -> anyhow::Result<PlayServer> {
        let node_id = self.cfg.node_id.clone();
        let runtime = Arc::new(Runtime {
            node_id,
            stages: StagePool::new(),
            sessions: SessionTable::new(),
            timers: TimerService::new(),
            cluster: Cluster::new(&self.cfg),
            api: ApiHost::new(),
            cfg: self.cfg,
        });
        for (stage_type, factory) in self.factories {
            runtime.stages.register_factory(&stage_type, factory);
        }
        for (msg_id, controller) in self.controllers {
            runtime.api.register(&msg_id, controller);
        }
        runtime.cluster.attach(&runtime);

        let mut tasks = Vec::new();
        let mut client_addr = None;
        let mut s2s_addr = None;

        if let Some(bind) = runtime.cfg.client_bind {
            let listener = bind_listener(bind, &runtime.cfg).with_context(|| format!("cannot bind client listener {}", bind))?;
            client_addr = Some(listener.local_addr()?);
            let tls = if runtime.cfg.use_ssl {
                let certificate = runtime
                    .cfg
                    .certificate_path
                    .as_deref()
                    .context("use_ssl requires certificate_path")?;
                let key = runtime
                    .cfg
                    .private_key_path
                    .as_deref()
                    .context("use_ssl requires private_key_path")?;
                Some(transport::tls::server_acceptor(certificate, key)?)
            } else {
                None
            };
            tasks.push(tokio::spawn(run_client_listener(runtime.clone(), listener, tls)));
        }
        if let Some(bind) = runtime.cfg.s2s_bind {
            let listener = bind_listener(bind, &runtime.cfg).with_context(|| format!("cannot bind s2s listener {}", bind))?;
            s2s_addr = Some(listener.local_addr()?);
            tasks.push(tokio::spawn(run_s2s_listener(runtime.clone(), listener)));
        }
        info!(
            "node {} started (client {:?}, s2s {:?})",
            runtime.node_id, client_addr, s2s_addr
        );
        Ok(PlayServer {
            runtime,
            tasks,
            client_addr,
            s2s_addr,
        })
    }
}

/// One running server node.
pub struct PlayServer {
    runtime: Arc<Runtime>,
    tasks: Vec<JoinHandle<()>>,
    client_addr: Option<SocketAddr>,
    s2s_addr: Option<SocketAddr>,
}

impl PlayServer {
    /// This node's id.
    pub fn node_id(&self) -> &str {
        &self.runtime.node_id
    }

    /// The bound client endpoint, when a client listener is up.
    pub fn client_addr(&self) -> Option<SocketAddr> {
        self.client_addr
    }

    /// The bound S2S endpoint, when the peer listener is up.
    pub fn s2s_addr(&self) -> Option<SocketAddr> {
        self.s2s_addr
    }

    /// Add or update a peer in the fleet table.
    pub fn add_peer(&self, peer: PeerConfig) {
        self.runtime.cluster.add_peer(peer.node_id, peer.address, peer.service_id);
    }

    /// Create a stage of a registered type on this node.
    pub async fn create_stage(&self, stage_type: &str, stage_id: Option<StageId>, payload: Vec<u8>) -> Result<StageId, u16> {
        let creation = Packet::new(crate::packet::MSG_CREATE_STAGE, payload);
        self.runtime
            .stages
            .create_stage(&self.runtime, stage_type, stage_id, creation)
            .await
    }

    /// Destroy a stage on this node. Returns whether the destroy item was
    /// queued.
    pub fn destroy_stage(&self, stage_id: StageId) -> bool {
        self.runtime.stages.destroy_stage(stage_id)
    }

    /// Queue depth and drain state for every live stage.
    pub fn stage_stats(&self) -> Vec<StageStats> {
        self.runtime.stage_stats()
    }

    /// Live stage count.
    pub fn stage_count(&self) -> usize {
        self.runtime.stages.len()
    }

    /// Live client session count.
    pub fn session_count(&self) -> usize {
        self.runtime.sessions.len()
    }

    /// Stop the listeners and destroy every stage.
    pub async fn shutdown(self) {
        info!("node {} shutting down", self.runtime.node_id);
        for task in &self.tasks {
            task.abort();
        }
        for handle in self.runtime.stages.handles() {
            if let Err(e) = handle.post(crate::packet::RoutePacket::Close) {
                debug!("stage {} already closing: {}", handle.stage_id, e);
            }
        }
        // let stage loops observe the close items
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn bind_listener(addr: SocketAddr, cfg: &ServerConfig) -> anyhow::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    if let Some(size) = cfg.receive_buffer_size {
        socket.set_recv_buffer_size(size)?;
    }
    if let Some(size) = cfg.send_buffer_size {
        socket.set_send_buffer_size(size)?;
    }
    socket.bind(addr)?;
    Ok(socket.listen(1024)?)
}

async fn run_client_listener(runtime: Arc<Runtime>, listener: TcpListener, tls: Option<TlsAcceptor>) {
    info!(
        "{} accepting clients on {}",
        runtime.node_id,
        listener.local_addr().map(|a| a.to_string()).unwrap_or_default()
    );
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                let runtime = runtime.clone();
                let tls = tls.clone();
                tokio::spawn(async move {
                    let accepted = transport::accept_client(
                        stream,
                        runtime.cfg.use_websocket,
                        &runtime.cfg.web_socket_path,
                        tls.as_ref(),
                        runtime.cfg.max_packet_size as usize,
                    )
                    .await;
                    match accepted {
                        Ok((source, sink)) => {
                            let session_id = spawn_session(runtime.clone(), source, sink);
                            debug!("session {} accepted from {}", session_id, peer_addr);
                        }
                        Err(e) => debug!("handshake with {} failed: {}", peer_addr, e),
                    }
                });
            }
            Err(e) => {
                warn!("client accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Build a tokio runtime sized per the configuration, for hosts that do
/// not bring their own.
pub fn build_runtime(cfg: &ServerConfig) -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cfg.worker_threads.max(1))
        .enable_all()
        .build()
}

/// Build a bare runtime with no listeners, for in-crate tests.
#[cfg(test)]
pub(crate) fn test_runtime(cfg: ServerConfig) -> Arc<Runtime> {
    let runtime = Arc::new(Runtime {
        node_id: cfg.node_id.clone(),
        stages: StagePool::new(),
        sessions: SessionTable::new(),
        timers: TimerService::new(),
        cluster: Cluster::new(&cfg),
        api: ApiHost::new(),
        cfg,
    });
    runtime.cluster.attach(&runtime);
    runtime
}

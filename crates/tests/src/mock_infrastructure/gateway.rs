//! A fully wired gateway running against the mocks.

use fulcrum_http_core::{
    p2p::{BlockSource, P2pPeer},
    proxy::ProxyEngine,
    upstream::{ElectrumConnector, PoolManager},
};
use std::{sync::Arc, time::Duration};
use tokio::{sync::broadcast, task::JoinHandle};

use super::{
    electrum_mock::{MockElectrumServer, Transport},
    p2p_mock::MockP2pNode,
    test_helpers::{test_p2p_config, test_upstream_config, TestBlock},
};

pub struct TestGateway {
    pub electrum: MockElectrumServer,
    pub node: MockP2pNode,
    pub peer: Arc<P2pPeer>,
    pub pool: Arc<PoolManager>,
    pub engine: Arc<ProxyEngine>,
    shutdown_tx: broadcast::Sender<()>,
    peer_task: Option<JoinHandle<()>>,
}

impl TestGateway {
    /// Starts both mocks, serving `blocks`, and a dispatcher whose default server is
    /// the Electrum mock.
    ///
    /// # Panics
    ///
    /// Panics if a mock cannot bind a local port.
    pub async fn start(transport: Transport, blocks: &[TestBlock]) -> Self {
        let electrum = match transport {
            Transport::WebSocket => MockElectrumServer::websocket().await,
            Transport::Tcp => MockElectrumServer::tcp().await,
        }
        .expect("electrum mock should bind");
        let node = MockP2pNode::start().await.expect("p2p mock should bind");
        for block in blocks {
            electrum.add_block(block);
            node.add_block(block);
        }

        let (shutdown_tx, _) = broadcast::channel(1);
        let peer = Arc::new(
            P2pPeer::new(test_p2p_config(node.addr())).expect("test magic should be valid"),
        );
        let peer_task = tokio::spawn(Arc::clone(&peer).run(shutdown_tx.subscribe()));

        let upstream = test_upstream_config(&electrum.url());
        let pool = Arc::new(PoolManager::new(
            Arc::new(ElectrumConnector::new(upstream.clone())),
            upstream.idle_timeout(),
        ));
        let engine = Arc::new(ProxyEngine::new(
            Arc::clone(&pool),
            Arc::clone(&peer) as Arc<dyn BlockSource>,
            upstream.default_server,
        ));

        Self { electrum, node, peer, pool, engine, shutdown_tx, peer_task: Some(peer_task) }
    }

    /// Stops the peer supervisor and disconnects every pooled client.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(());
        self.pool.shutdown().await;
        if let Some(task) = self.peer_task.take() {
            let _ = tokio::time::timeout(Duration::from_secs(2), task).await;
        }
    }
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        if let Some(task) = self.peer_task.take() {
            task.abort();
        }
    }
}

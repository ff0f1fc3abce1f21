use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::{
    p2p::BlockSource,
    types::{RpcRequest, RpcResponse, BLOCK_GET_METHOD},
    upstream::{PoolManager, PooledClient, UpstreamClient},
};

use super::{errors::ProxyError, handlers::BlocksHandler};

/// Shared context for all proxy handlers.
///
/// Groups the collaborators every handler needs so each holds a single `Arc`.
pub struct SharedContext {
    pub pool: Arc<PoolManager>,
    pub block_source: Arc<dyn BlockSource>,
    pub default_server: String,
}

/// Request dispatcher.
///
/// Resolves the upstream server for a call, obtains its pooled client and either
/// forwards the call verbatim or, for `blockchain.block.get`, hands it to the
/// [`BlocksHandler`].
pub struct ProxyEngine {
    ctx: Arc<SharedContext>,
    blocks_handler: BlocksHandler,
}

impl ProxyEngine {
    #[must_use]
    pub fn new(
        pool: Arc<PoolManager>,
        block_source: Arc<dyn BlockSource>,
        default_server: impl Into<String>,
    ) -> Self {
        let ctx = Arc::new(SharedContext {
            pool,
            block_source,
            default_server: default_server.into(),
        });
        let blocks_handler = BlocksHandler::new(Arc::clone(&ctx));

        Self { ctx, blocks_handler }
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<PoolManager> {
        &self.ctx.pool
    }

    #[must_use]
    pub fn default_server(&self) -> &str {
        &self.ctx.default_server
    }

    /// Parses `body`, processes it and wraps the outcome in a response envelope.
    ///
    /// Every failure, including a body that is not a valid request, becomes a failure
    /// envelope; this never returns without a response.
    pub async fn handle_body(&self, server: Option<&str>, body: &[u8]) -> RpcResponse {
        let request = match RpcRequest::from_slice(body) {
            Ok(request) => request,
            Err(e) => {
                debug!(error = %e, "rejecting malformed request");
                return RpcResponse::from_error(&e);
            }
        };

        let id = request.response_id();
        let method = request.method.clone();

        match self.process_request(server, request).await {
            Ok(result) => RpcResponse::success(id, result),
            Err(e) => {
                warn!(method = %method, error = %e, "request failed");
                RpcResponse::from_error(&e)
            }
        }
    }

    /// Processes a parsed request against `server`, or the default server when absent.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Upstream`] when the connection or the remote call fails
    /// (including error values returned by the server), plus any error of the block
    /// handler for `blockchain.block.get`.
    pub async fn process_request(
        &self,
        server: Option<&str>,
        request: RpcRequest,
    ) -> Result<Value, ProxyError> {
        let server =
            server.filter(|server| !server.is_empty()).unwrap_or(&self.ctx.default_server);
        debug!(method = %request.method, server, "processing request");

        let client = self.ctx.pool.get_client(server).await?;
        self.handle_request(&client, request).await
    }

    async fn handle_request(
        &self,
        client: &PooledClient,
        request: RpcRequest,
    ) -> Result<Value, ProxyError> {
        match request.method.as_str() {
            BLOCK_GET_METHOD => self.blocks_handler.handle_block_get(client, &request.params).await,
            method => Ok(client.request(method, request.params).await?),
        }
    }
}

#[cfg(test)]
impl SharedContext {
    /// Context whose pool can never connect, for handlers that receive their client
    /// directly.
    pub(crate) fn for_tests(block_source: Arc<dyn BlockSource>) -> Self {
        use crate::upstream::{UpstreamConnector, UpstreamError};
        use async_trait::async_trait;

        struct Unreachable;

        #[async_trait]
        impl UpstreamConnector for Unreachable {
            async fn connect(
                &self,
                _url: &url::Url,
            ) -> Result<Arc<dyn UpstreamClient>, UpstreamError> {
                Err(UpstreamError::ConnectionFailed("unreachable".into()))
            }
        }

        Self {
            pool: Arc::new(PoolManager::new(
                Arc::new(Unreachable),
                std::time::Duration::from_secs(300),
            )),
            block_source,
            default_server: "tcp://127.0.0.1:1".to_string(),
        }
    }
}

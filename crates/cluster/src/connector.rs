use std::error::Error;

use async_trait::async_trait;
use tandem_balancer::Node;

/// Opens and closes the connections of this member to a database node.
#[async_trait]
pub trait NodeConnector: Send + Sync + 'static {
    /// Makes `node` usable. Called before the node is activated.
    async fn connect(&self, node: &Node) -> Result<(), Box<dyn Error + Send + Sync>>;

    /// Releases `node`. Called after the node is deactivated.
    async fn disconnect(&self, node: &Node);
}

/// For nodes that need no connection management.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopConnector;

#[async_trait]
impl NodeConnector for NoopConnector {
    async fn connect(&self, _node: &Node) -> Result<(), Box<dyn Error + Send + Sync>> {
        Ok(())
    }

    async fn disconnect(&self, _node: &Node) {}
}

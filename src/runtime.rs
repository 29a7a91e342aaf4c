use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::info;

use crate::agent::{AgentRuntime, OpenAiCompatibleClient, ReactAgent};
use crate::config::Config;
use crate::gateway::ActionGateway;
use crate::gateway_server::ObserverServer;

pub struct GatewayRuntime {
    config: Config,
}

impl GatewayRuntime {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub async fn run(self) -> Result<()> {
        prepare_root(&self.config).await?;
        let gateway = Arc::new(ActionGateway::from_config(&self.config)?);
        let model = OpenAiCompatibleClient::new(&self.config.agent)?;

        info!(
            "starting action gateway (root={}, bind={}, model={}, endpoint={}, max_steps={}, search={})",
            gateway.files().root().display(),
            self.config.server.bind,
            self.config.agent.model,
            model.endpoint(),
            self.config.agent.max_steps,
            self.config.search.enabled
        );

        let runtime: Arc<dyn AgentRuntime> = Arc::new(ReactAgent::new(
            Arc::new(model),
            gateway.catalogue(),
            self.config.agent.max_steps,
        ));
        let server = ObserverServer::new(self.config.server.clone(), gateway, runtime);
        tokio::select! {
            res = server.run_forever() => res,
            _ = signal::ctrl_c() => {
                info!("received ctrl-c, shutting down");
                Ok(())
            }
        }
    }
}

/// Creates the sandbox root when configured to, so the guard canonicalizes
/// against the real directory.
pub async fn prepare_root(config: &Config) -> Result<()> {
    let root = &config.sandbox.root_dir;
    if config.sandbox.create_root && !root.exists() {
        tokio::fs::create_dir_all(root)
            .await
            .with_context(|| format!("failed creating sandbox root {}", root.display()))?;
        info!("created sandbox root {}", root.display());
    }
    Ok(())
}

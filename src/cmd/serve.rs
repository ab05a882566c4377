//! REST server command: `svnlift serve`.

use anyhow::Result;
use svnlift::config::SvnliftConfig;
use svnlift::migration::server::{ServerConfig, start_server};

pub async fn cmd_serve(config: &SvnliftConfig, dev: bool) -> Result<()> {
    if config.gitlab.token.is_empty() {
        tracing::warn!("no GitLab token configured; project creation will be rejected");
    }
    start_server(
        config,
        ServerConfig {
            port: config.server.port,
            db_path: config.server.db_path.clone(),
            dev_mode: dev,
        },
    )
    .await
}

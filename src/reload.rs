//! Reload controller
//!
//! `/reload` rereads the configuration file the process was started
//! with, validates it, and atomically swaps in a freshly built policy.
//! When both the outgoing and incoming policies are Q-learning, the
//! learned state is snapshotted before the swap and imported after, so
//! a reload never discards what live traffic has taught the table
//! (α still follows the new configuration).
//!
//! A rejected config leaves the active policy untouched: validation
//! failures answer 400, read/parse failures 500.

use std::sync::Arc;

use hyper::{Response, StatusCode};
use log::{error, info, warn};

use crate::config::Config;
use crate::error::ConfigError;
use crate::policy::{self, Policy};
use crate::server::{text_response, ProxyBody};
use crate::state::{AppContext, RuntimeConfig};

/// HTTP surface of the controller.
pub async fn handle(ctx: &Arc<AppContext>) -> Response<ProxyBody> {
    info!("Reloading configuration...");
    match reload(ctx).await {
        Ok(()) => {
            info!("Configuration reloaded successfully");
            text_response(StatusCode::OK, "Configuration reloaded")
        }
        Err(e) if e.is_validation() => {
            warn!("Configuration reload rejected: {}", e);
            text_response(
                StatusCode::BAD_REQUEST,
                &format!("Invalid configuration: {}", e),
            )
        }
        Err(e) => {
            error!("Configuration reload failed: {}", e);
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to reload config")
        }
    }
}

/// Load, validate, and swap. Only a fully validated config reaches the
/// swap; any earlier failure leaves the running policy as it was.
pub async fn reload(ctx: &Arc<AppContext>) -> Result<(), ConfigError> {
    let config_path = ctx.runtime().config_path.clone();
    let new_config = Config::load_from_file(&config_path).await?;
    let algorithm = new_config.algorithm()?;

    if ctx.runtime().config.port != new_config.port {
        warn!(
            "Port change detected ({} -> {}). Port changes require a restart.",
            ctx.runtime().config.port,
            new_config.port
        );
    }

    // Snapshot the outgoing policy's learned state before it goes away.
    let outgoing = ctx.policy();
    let snapshot = outgoing.as_q_learning().map(|q| q.export_state());

    let new_policy = policy::build_policy(&new_config, algorithm);
    if let (Some(snapshot), Some(incoming)) = (snapshot, new_policy.as_q_learning()) {
        incoming.import_state(snapshot);
        info!("Q-learning state carried across reload");
    }

    ctx.swap_policy(new_policy);
    ctx.swap_runtime(RuntimeConfig {
        config: new_config,
        config_path,
    });

    Ok(())
}

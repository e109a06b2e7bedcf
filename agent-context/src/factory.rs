//! Picks the context manager for the lifetime of the agent.

use std::error::Error as StdError;
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::future::Future;

use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::async_local::AsyncLocalContextManager;
use crate::context::Context;
use crate::legacy::LegacyContextManager;
use crate::manager::{ContextManager, ManagerState};

/// The part of the agent configuration that decides the strategy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ContextManagerConfig {
    pub feature_flag: FeatureFlags,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FeatureFlags {
    /// Propagate context through causal chains instead of only across
    /// synchronous calls.
    pub async_local_context: bool,
    /// Reserved for a strategy that does not exist yet; selecting it is a
    /// configuration error.
    pub new_async_context: bool,
}

impl ContextManagerConfig {
    pub fn strategy(&self) -> Result<ContextStrategy, CreateContextManagerError> {
        if self.feature_flag.new_async_context {
            return Err(CreateContextManagerError::NotImplemented {
                flag: "new_async_context",
            });
        }

        if self.feature_flag.async_local_context {
            Ok(ContextStrategy::AsyncLocal)
        } else {
            Ok(ContextStrategy::Legacy)
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ContextStrategy {
    Legacy,
    AsyncLocal,
}

impl Display for ContextStrategy {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            ContextStrategy::Legacy => write!(f, "legacy"),
            ContextStrategy::AsyncLocal => write!(f, "async-local"),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CreateContextManagerError {
    NotImplemented { flag: &'static str },
}

impl Display for CreateContextManagerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            CreateContextManagerError::NotImplemented { flag } => write!(
                f,
                "the context manager selected by feature_flag.{flag} is not implemented"
            ),
        }
    }
}

impl StdError for CreateContextManagerError {}

/// Builds the context manager the configuration asks for.
///
/// The manager is returned uninitialized, the caller enables it once the rest
/// of the agent is ready.
pub fn create_context_manager(
    config: &ContextManagerConfig,
) -> Result<AgentContextManager, CreateContextManagerError> {
    let strategy = match config.strategy() {
        Ok(strategy) => strategy,
        Err(err) => {
            error!("cannot create context manager: {err}");
            return Err(err);
        }
    };

    info!("using {strategy} context manager");

    let manager = match strategy {
        ContextStrategy::Legacy => AgentContextManager::Legacy(LegacyContextManager::new()),
        ContextStrategy::AsyncLocal => {
            AgentContextManager::AsyncLocal(AsyncLocalContextManager::new())
        }
    };

    Ok(manager)
}

/// The context manager chosen at startup.
pub enum AgentContextManager {
    Legacy(LegacyContextManager),
    AsyncLocal(AsyncLocalContextManager),
}

impl AgentContextManager {
    pub fn strategy(&self) -> ContextStrategy {
        match self {
            AgentContextManager::Legacy(_) => ContextStrategy::Legacy,
            AgentContextManager::AsyncLocal(_) => ContextStrategy::AsyncLocal,
        }
    }

    pub fn as_async_local(&self) -> Option<&AsyncLocalContextManager> {
        match self {
            AgentContextManager::Legacy(_) => None,
            AgentContextManager::AsyncLocal(manager) => Some(manager),
        }
    }
}

impl ContextManager for AgentContextManager {
    fn get_context(&self) -> Context {
        match self {
            AgentContextManager::Legacy(manager) => manager.get_context(),
            AgentContextManager::AsyncLocal(manager) => manager.get_context(),
        }
    }

    fn set_context(&self, context: Context) {
        match self {
            AgentContextManager::Legacy(manager) => manager.set_context(context),
            AgentContextManager::AsyncLocal(manager) => manager.set_context(context),
        }
    }

    fn run_with_context<F, R>(&self, context: Context, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        match self {
            AgentContextManager::Legacy(manager) => manager.run_with_context(context, f),
            AgentContextManager::AsyncLocal(manager) => manager.run_with_context(context, f),
        }
    }

    fn spawn_local<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        match self {
            AgentContextManager::Legacy(manager) => manager.spawn_local(future),
            AgentContextManager::AsyncLocal(manager) => manager.spawn_local(future),
        }
    }

    fn enable(&self) {
        match self {
            AgentContextManager::Legacy(manager) => manager.enable(),
            AgentContextManager::AsyncLocal(manager) => manager.enable(),
        }
    }

    fn disable(&self) {
        match self {
            AgentContextManager::Legacy(manager) => manager.disable(),
            AgentContextManager::AsyncLocal(manager) => manager.disable(),
        }
    }

    fn state(&self) -> ManagerState {
        match self {
            AgentContextManager::Legacy(manager) => manager.state(),
            AgentContextManager::AsyncLocal(manager) => manager.state(),
        }
    }
}

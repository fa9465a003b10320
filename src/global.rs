//! Process-wide [`ConnectionManager`].
//!
//! Applications with a single real-time endpoint call [`init`] once at
//! startup and [`get`] everywhere else. Tests that need isolation construct
//! their own managers instead.

use std::sync::{Arc, PoisonError, RwLock};

use crate::Result;
use crate::auth::TokenProvider;
use crate::ws::{Config, ConnectionManager};

static GLOBAL: RwLock<Option<ConnectionManager>> = RwLock::new(None);

/// Install the global manager, or return the one already installed.
///
/// `endpoint`, `config` and `tokens` are ignored when a manager exists.
pub fn init(endpoint: &str, config: Config, tokens: Arc<dyn TokenProvider>) -> Result<ConnectionManager> {
    let mut global = GLOBAL.write().unwrap_or_else(PoisonError::into_inner);
    if let Some(manager) = global.as_ref() {
        return Ok(manager.clone());
    }

    let manager = ConnectionManager::new(endpoint, config, tokens)?;
    *global = Some(manager.clone());
    Ok(manager)
}

/// The global manager, if [`init`] has been called.
#[must_use]
pub fn get() -> Option<ConnectionManager> {
    GLOBAL
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Tear down and uninstall the global manager. A no-op when none is installed.
pub async fn teardown() {
    let manager = GLOBAL
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    if let Some(manager) = manager {
        manager.teardown().await;
    }
}

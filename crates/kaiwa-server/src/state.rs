//! Shared application state, built once in `main` and never mutated after.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Notify, RwLock};

use kaiwa_modules::{MetricsRecorder, ModuleRegistry};
use kaiwa_pipeline::{SessionCommand, Timeouts};

use crate::auth::AuthKeys;
use crate::store::Store;

/// A live session actor and the connection currently attached to it.
pub struct SessionHandle {
    pub cmd_tx: mpsc::UnboundedSender<SessionCommand>,
    pub client_id: String,
    pub agent_id: i64,
    /// Fired to tell the previous socket it has been supplanted.
    pub supplant: Option<Arc<Notify>>,
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub registry: Arc<ModuleRegistry>,
    pub metrics: MetricsRecorder,
    pub auth: Arc<AuthKeys>,
    pub timeouts: Timeouts,
    pub sessions: Arc<RwLock<HashMap<String, SessionHandle>>>,
}

impl AppState {
    pub fn new(
        store: Store,
        registry: Arc<ModuleRegistry>,
        metrics: MetricsRecorder,
        auth: AuthKeys,
    ) -> Self {
        Self {
            store: Arc::new(store),
            registry,
            metrics,
            auth: Arc::new(auth),
            timeouts: Timeouts::default(),
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Drop the handle for a finished session.
    pub async fn remove_session(&self, session_id: &str) {
        self.sessions.write().await.remove(session_id);
    }
}

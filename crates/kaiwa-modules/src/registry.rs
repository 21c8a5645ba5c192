//! Module registry: constructs provider modules from the catalog and exposes
//! idempotent `(kind, code)` lookup for dispatch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{OnceCell, RwLock};
use tracing::{info, warn};

use kaiwa_core::{Error, ModuleParams, ModuleSelection, Result};

use crate::catalog::{merge_config, ModuleCatalog};
use crate::module::{Module, ModuleFactory, ModuleKind};

struct ModuleSlot {
    module: Arc<dyn Module>,
    /// Guards the single `init` per process lifetime.
    init: OnceCell<()>,
    healthy: AtomicBool,
}

impl ModuleSlot {
    async fn ensure_init(&self, kind: ModuleKind, code: &str) -> bool {
        self.init
            .get_or_init(|| async {
                match self.module.init().await {
                    Ok(()) => {
                        self.healthy.store(true, Ordering::Release);
                        info!(kind = %kind, code, "module initialized");
                    }
                    Err(err) => {
                        self.healthy.store(false, Ordering::Release);
                        warn!(kind = %kind, code, error = %err, "module init failed, excluded from dispatch");
                    }
                }
            })
            .await;
        self.healthy.load(Ordering::Acquire)
    }
}

/// Read-mostly after startup; `reload` swaps the slot table without stopping
/// in-flight calls (existing `Arc<dyn Module>` handles stay valid).
pub struct ModuleRegistry {
    factories: HashMap<(ModuleKind, String), Box<dyn ModuleFactory>>,
    slots: RwLock<HashMap<(ModuleKind, String), Arc<ModuleSlot>>>,
    defaults: RwLock<HashMap<ModuleKind, String>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            slots: RwLock::new(HashMap::new()),
            defaults: RwLock::new(HashMap::new()),
        }
    }

    /// Register a factory for `(kind, code)`. Call before `load`; later
    /// registrations for the same pair replace the earlier one.
    pub fn register_factory(
        &mut self,
        kind: ModuleKind,
        code: &str,
        factory: Box<dyn ModuleFactory>,
    ) {
        self.factories.insert((kind, code.to_string()), factory);
    }

    /// Construct every cataloged module (cheap phase). `init` runs lazily on
    /// first dispatch or eagerly via [`Self::init_all`].
    pub async fn load(&self, catalog: &ModuleCatalog) -> Result<()> {
        let mut slots = HashMap::new();
        let mut defaults = HashMap::new();

        for entry in &catalog.services {
            let key = (entry.kind, entry.code.clone());
            let Some(factory) = self.factories.get(&key) else {
                warn!(kind = %entry.kind, code = %entry.code, "no factory registered, skipping");
                continue;
            };
            let config = merge_config(factory.default_config(), &entry.config);
            let module = factory.create(config)?;
            slots.insert(
                key,
                Arc::new(ModuleSlot {
                    module,
                    init: OnceCell::new(),
                    healthy: AtomicBool::new(false),
                }),
            );
            if entry.is_default {
                defaults.insert(entry.kind, entry.code.clone());
            }
        }

        *self.slots.write().await = slots;
        *self.defaults.write().await = defaults;
        Ok(())
    }

    /// Initialize every module eagerly; failures are logged and the module is
    /// excluded, the process keeps starting.
    pub async fn init_all(&self) {
        let slots = self.slots.read().await.clone();
        for ((kind, code), slot) in slots {
            slot.ensure_init(kind, &code).await;
        }
    }

    /// Hot reload from a fresh catalog. Sessions holding old module handles
    /// keep using them until their next resolve.
    pub async fn reload(&self, catalog: &ModuleCatalog) -> Result<()> {
        catalog.validate()?;
        self.load(catalog).await?;
        self.init_all().await;
        Ok(())
    }

    /// Lookup by exact `(kind, code)`, initializing on first use.
    pub async fn get(&self, kind: ModuleKind, code: &str) -> Result<Arc<dyn Module>> {
        let slot = {
            let slots = self.slots.read().await;
            slots.get(&(kind, code.to_string())).cloned()
        };
        let Some(slot) = slot else {
            return Err(Error::ModuleUnavailable {
                kind: kind.as_str().to_string(),
                code: code.to_string(),
            });
        };
        if !slot.ensure_init(kind, code).await {
            return Err(Error::ModuleUnavailable {
                kind: kind.as_str().to_string(),
                code: code.to_string(),
            });
        }
        Ok(slot.module.clone())
    }

    /// Resolve a kind through the agent's module params, falling back to the
    /// catalog default for that kind.
    pub async fn resolve(
        &self,
        kind: ModuleKind,
        params: &ModuleParams,
    ) -> Result<Arc<dyn Module>> {
        if let Some(selection) = selection_for(params, kind) {
            return self.get(kind, &selection.code).await;
        }
        let default = { self.defaults.read().await.get(&kind).cloned() };
        match default {
            Some(code) => self.get(kind, &code).await,
            None => Err(Error::ModuleUnavailable {
                kind: kind.as_str().to_string(),
                code: "<default>".to_string(),
            }),
        }
    }

    /// Per-session module config override, if the agent carries one.
    pub fn selection_config(params: &ModuleParams, kind: ModuleKind) -> serde_json::Value {
        selection_for(params, kind)
            .map(|s| s.config.clone())
            .unwrap_or(serde_json::Value::Null)
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn selection_for(params: &ModuleParams, kind: ModuleKind) -> Option<&ModuleSelection> {
    match kind {
        ModuleKind::Vad => params.vad.as_ref(),
        ModuleKind::Asr => params.asr.as_ref(),
        ModuleKind::Llm => params.llm.as_ref(),
        ModuleKind::Tts => params.tts.as_ref(),
        ModuleKind::Memory => params.memory.as_ref(),
        ModuleKind::Intent => params.intent.as_ref(),
    }
}

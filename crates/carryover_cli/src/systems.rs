//! Systems described by the config file.

use crate::config::SystemDef;
use carryover_engine::{
    EngineError, EngineResult, HttpClient, HttpRequest, HttpResponse, HttpSystem, MemorySystem,
    Method, RemoteSystem, SystemRegistry, TokenProvider,
};
use carryover_ledger::SystemId;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// [`HttpClient`] over a blocking `ureq` agent.
#[derive(Debug, Clone)]
pub struct UreqClient {
    agent: ureq::Agent,
}

impl UreqClient {
    /// Creates a client with connect and read timeouts.
    pub fn new(timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout_read(timeout)
            .build();
        Self { agent }
    }
}

impl HttpClient for UreqClient {
    fn execute(&self, request: &HttpRequest) -> EngineResult<HttpResponse> {
        let mut call = self
            .agent
            .request(request.method.as_str(), &request.url)
            .set("Accept", "application/json");
        for (name, value) in &request.headers {
            call = call.set(name, value);
        }

        let sent = match (&request.method, &request.body) {
            (Method::Post, Some(body)) => call
                .set("Content-Type", "application/json")
                .send_string(&body.to_string()),
            _ => call.call(),
        };

        let response = match sent {
            Ok(response) => response,
            Err(ureq::Error::Status(_, response)) => response,
            Err(ureq::Error::Transport(err)) => {
                return Err(EngineError::transport(
                    format!("{} {} failed: {err}", request.method.as_str(), request.url),
                    None,
                    true,
                ))
            }
        };
        let status = response.status();
        let body = response
            .into_string()
            .map_err(|err| EngineError::transport(format!("cannot read response: {err}"), None, true))?;
        Ok(HttpResponse { status, body })
    }
}

/// Tokens read from environment variables named in the config.
#[derive(Debug, Default)]
pub struct EnvTokens {
    vars: HashMap<SystemId, String>,
}

impl EnvTokens {
    /// Collects the `token_env` of every HTTP system.
    pub fn from_systems(systems: &BTreeMap<String, SystemDef>) -> Self {
        let vars = systems
            .iter()
            .filter_map(|(id, def)| match def {
                SystemDef::Http {
                    token_env: Some(var),
                    ..
                } => Some((SystemId::new(id.as_str()), var.clone())),
                _ => None,
            })
            .collect();
        Self { vars }
    }
}

impl TokenProvider for EnvTokens {
    fn token(&self, system: &SystemId) -> Option<String> {
        let var = self.vars.get(system)?;
        std::env::var(var).ok().filter(|token| !token.is_empty())
    }
}

/// Connects to configured systems.
///
/// File-backed systems are loaded once and shared between connections;
/// snapshot systems are written back by [`ConfigRegistry::save_snapshots`].
pub struct ConfigRegistry {
    systems: BTreeMap<String, SystemDef>,
    timeout: Duration,
    loaded: Mutex<HashMap<SystemId, Arc<MemorySystem>>>,
}

impl std::fmt::Debug for ConfigRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigRegistry")
            .field("systems", &self.systems.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl ConfigRegistry {
    /// Creates a registry over `systems`.
    pub fn new(systems: BTreeMap<String, SystemDef>, timeout: Duration) -> Self {
        Self {
            systems,
            timeout,
            loaded: Mutex::new(HashMap::new()),
        }
    }

    fn memory(&self, id: &SystemId, load: impl FnOnce() -> EngineResult<MemorySystem>) -> EngineResult<Arc<MemorySystem>> {
        let mut loaded = self.loaded.lock();
        if let Some(system) = loaded.get(id) {
            return Ok(Arc::clone(system));
        }
        let system = Arc::new(load()?);
        loaded.insert(id.clone(), Arc::clone(&system));
        Ok(system)
    }

    /// Writes every loaded snapshot system back to its file.
    pub fn save_snapshots(&self) -> EngineResult<usize> {
        let loaded = self.loaded.lock();
        let mut saved = 0;
        for (id, system) in loaded.iter() {
            if let Some(SystemDef::Snapshot { path }) = self.systems.get(id.as_str()) {
                system.save_snapshot(path)?;
                info!(system = %id, path = %path.display(), "snapshot saved");
                saved += 1;
            }
        }
        Ok(saved)
    }
}

impl SystemRegistry for ConfigRegistry {
    fn connect(&self, system: &SystemId, token: Option<String>) -> EngineResult<Arc<dyn RemoteSystem>> {
        let def = self
            .systems
            .get(system.as_str())
            .ok_or_else(|| EngineError::UnknownSystem(system.clone()))?;
        debug!(system = %system, "connecting");
        match def {
            SystemDef::Export { path } => {
                let loaded = self.memory(system, || MemorySystem::load_export(system.as_str(), path))?;
                Ok(loaded)
            }
            SystemDef::Snapshot { path } => {
                let loaded = self.memory(system, || MemorySystem::load_snapshot(system.as_str(), path))?;
                Ok(loaded)
            }
            SystemDef::Http {
                base_url,
                bulk,
                lookup,
                balances,
                orders,
                ..
            } => {
                let http = HttpSystem::new(system.as_str(), base_url.as_str(), UreqClient::new(self.timeout))
                    .with_token(token)
                    .with_bulk(*bulk)
                    .with_lookup(*lookup)
                    .with_balances(*balances)
                    .with_orders(*orders);
                Ok(Arc::new(http))
            }
        }
    }
}

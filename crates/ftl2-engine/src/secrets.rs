//! Secret resolution, injection bindings, and redaction.
//!
//! Secrets come from two backends: controller environment variables and a
//! KV store addressed as `path#field` references. Everything resolves at
//! context entry; a missing secret is fatal before any module runs (fail
//! closed). Bindings declare which secrets flow into which module
//! parameters, so scripts never handle the values themselves, and the
//! redactor strips the same parameters before anything reaches the audit
//! log.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{EngineError, Result};

const REDACTED: &str = "[redacted]";

/// Parameter names that always carry credentials, masked regardless of
/// bindings.
const SENSITIVE_PARAMS: &[&str] = &["password", "token", "bearer_token", "api_key"];

/// Declares what to resolve and where injected secrets go.
#[derive(Clone, Debug, Default)]
pub struct SecretSpec {
    /// Environment variable names resolved from the controller's env.
    pub env: Vec<String>,
    /// KV references: secret name -> "path#field".
    pub kv: BTreeMap<String, String>,
    /// Injection map: module pattern (glob over the FQCN) -> {param -> secret name}.
    pub bindings: BTreeMap<String, BTreeMap<String, String>>,
}

impl SecretSpec {
    pub fn is_empty(&self) -> bool {
        self.env.is_empty() && self.kv.is_empty() && self.bindings.is_empty()
    }
}

/// Read access to a KV secret store. One call per distinct path; the
/// resolver batches field lookups.
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn read_path(&self, path: &str) -> Result<BTreeMap<String, String>>;
}

/// Vault-style KV v2 backend over HTTP, configured by `VAULT_ADDR` and
/// `VAULT_TOKEN`. Values live under `data.data` in the response.
pub struct HttpKvBackend {
    address: String,
    token: String,
    client: reqwest::Client,
}

impl HttpKvBackend {
    pub fn from_env() -> Result<Self> {
        let address = std::env::var("VAULT_ADDR")
            .map_err(|_| EngineError::SecretMissing("VAULT_ADDR is not set".into()))?;
        let token = std::env::var("VAULT_TOKEN")
            .map_err(|_| EngineError::SecretMissing("VAULT_TOKEN is not set".into()))?;
        Ok(Self {
            address: address.trim_end_matches('/').to_string(),
            token,
            client: reqwest::Client::new(),
        })
    }
}

#[async_trait]
impl KvBackend for HttpKvBackend {
    async fn read_path(&self, path: &str) -> Result<BTreeMap<String, String>> {
        let url = format!("{}/v1/secret/data/{}", self.address, path);
        let response = self
            .client
            .get(&url)
            .header("X-Vault-Token", &self.token)
            .send()
            .await
            .map_err(|e| EngineError::SecretMissing(format!("kv read {path}: {e}")))?;
        if !response.status().is_success() {
            return Err(EngineError::SecretMissing(format!(
                "kv read {path}: HTTP {}",
                response.status()
            )));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| EngineError::SecretMissing(format!("kv read {path}: {e}")))?;
        let data = body
            .get("data")
            .and_then(|d| d.get("data"))
            .and_then(Value::as_object)
            .ok_or_else(|| {
                EngineError::SecretMissing(format!("kv read {path}: unexpected response shape"))
            })?;
        Ok(data
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
            .collect())
    }
}

/// Resolved secrets plus the binding and redaction logic.
pub struct SecretResolver {
    values: BTreeMap<String, String>,
    bindings: BTreeMap<String, BTreeMap<String, String>>,
}

impl SecretResolver {
    /// Resolves every declared secret, batching KV lookups by path. Any
    /// unresolved name fails the whole resolution.
    pub async fn resolve(spec: &SecretSpec, kv: Option<&dyn KvBackend>) -> Result<Self> {
        let mut values = BTreeMap::new();

        for name in &spec.env {
            let value = std::env::var(name)
                .map_err(|_| EngineError::SecretMissing(name.clone()))?;
            values.insert(name.clone(), value);
        }

        if !spec.kv.is_empty() {
            let backend = kv.ok_or_else(|| {
                EngineError::SecretMissing("kv references declared but no backend configured".into())
            })?;
            // One remote read per distinct path.
            let mut by_path: BTreeMap<String, Vec<(String, String)>> = BTreeMap::new();
            for (name, reference) in &spec.kv {
                let (path, field) = reference.rsplit_once('#').ok_or_else(|| {
                    EngineError::SecretMissing(format!(
                        "{name}: reference '{reference}' must be 'path#field'"
                    ))
                })?;
                by_path
                    .entry(path.to_string())
                    .or_default()
                    .push((name.clone(), field.to_string()));
            }
            for (path, fields) in by_path {
                let data = backend.read_path(&path).await?;
                for (name, field) in fields {
                    let value = data.get(&field).ok_or_else(|| {
                        EngineError::SecretMissing(format!(
                            "{name}: field '{field}' not found at '{path}'"
                        ))
                    })?;
                    values.insert(name, value.clone());
                }
            }
        }

        // Bindings may only reference declared secrets; catch dangling
        // references at entry rather than at first call.
        for (pattern, params) in &spec.bindings {
            for secret_name in params.values() {
                if !values.contains_key(secret_name) {
                    return Err(EngineError::SecretMissing(format!(
                        "binding {pattern}: '{secret_name}' is not a declared secret"
                    )));
                }
            }
        }

        tracing::debug!(count = values.len(), "secrets resolved");
        Ok(Self {
            values,
            bindings: spec.bindings.clone(),
        })
    }

    /// An empty resolver for contexts that declare no secrets.
    pub fn empty() -> Self {
        Self {
            values: BTreeMap::new(),
            bindings: BTreeMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Parameter injections for a module: every binding whose pattern
    /// matches the FQCN contributes its `{param: value}` pairs.
    pub fn bindings_for(&self, module_fqcn: &str) -> BTreeMap<String, String> {
        let mut injected = BTreeMap::new();
        for (pattern, params) in &self.bindings {
            if !pattern_matches(pattern, module_fqcn) {
                continue;
            }
            for (param, secret_name) in params {
                if let Some(value) = self.values.get(secret_name) {
                    injected.insert(param.clone(), value.clone());
                }
            }
        }
        injected
    }

    /// Strips injected and well-known credential parameters from a param
    /// map before it is recorded. Bound parameters are removed outright;
    /// sensitive names are masked so key presence stays auditable.
    pub fn redact(&self, params: &Value, module_fqcn: &str) -> Value {
        let bound = self.bindings_for(module_fqcn);
        let Some(map) = params.as_object() else {
            return params.clone();
        };
        let mut out = serde_json::Map::new();
        for (key, value) in map {
            if bound.contains_key(key) {
                continue;
            }
            if SENSITIVE_PARAMS.contains(&key.as_str()) {
                out.insert(key.clone(), Value::String(REDACTED.into()));
            } else if key == "headers" {
                out.insert(key.clone(), redact_headers(value));
            } else {
                out.insert(key.clone(), value.clone());
            }
        }
        Value::Object(out)
    }
}

fn redact_headers(headers: &Value) -> Value {
    let Some(map) = headers.as_object() else {
        return headers.clone();
    };
    let mut out = serde_json::Map::new();
    for (key, value) in map {
        if key.eq_ignore_ascii_case("authorization") {
            out.insert(key.clone(), Value::String(REDACTED.into()));
        } else {
            out.insert(key.clone(), value.clone());
        }
    }
    Value::Object(out)
}

fn pattern_matches(pattern: &str, fqcn: &str) -> bool {
    match glob::Pattern::new(pattern) {
        Ok(p) => p.matches(fqcn),
        Err(_) => pattern == fqcn,
    }
}

//! Inventory model: groups, hosts, and connection attributes.
//!
//! An inventory is an ordered mapping from group name to hosts, with a
//! distinguished `all` group, group-level vars, and transitive `children`.
//! Selectors resolve to a stable, de-duplicated host list in declaration
//! order. Sources: YAML documents, Ansible-style `--list` JSON, executable
//! inventory scripts, or an already-parsed value.

use std::collections::BTreeMap;
use std::path::Path;

use serde_json::Value;

use crate::error::{EngineError, Result};

/// How the engine reaches a host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transport {
    /// Run on the controller itself; no SSH session.
    Local,
    /// Run through an SSH session to `address:port`.
    Ssh,
}

/// One host with its connection attributes and user variables.
#[derive(Clone, Debug)]
pub struct Host {
    pub name: String,
    pub transport: Transport,
    pub address: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub private_key_file: Option<String>,
    pub vars: BTreeMap<String, Value>,
}

impl Host {
    /// Builds a host from an attribute map, following the recognized
    /// `ansible_*` keys; everything else becomes a host variable.
    pub fn from_attrs(name: &str, attrs: &BTreeMap<String, Value>) -> Result<Self> {
        let address = match attrs.get("ansible_host") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => {
                return Err(EngineError::InventoryInvalid(format!(
                    "host {name}: ansible_host must be a string, got {other}"
                )))
            }
            None => name.to_string(),
        };
        let port = match attrs.get("ansible_port") {
            Some(Value::Number(n)) => {
                n.as_u64().and_then(|p| u16::try_from(p).ok()).ok_or_else(|| {
                    EngineError::InventoryInvalid(format!("host {name}: invalid ansible_port"))
                })?
            }
            Some(other) => {
                return Err(EngineError::InventoryInvalid(format!(
                    "host {name}: ansible_port must be a number, got {other}"
                )))
            }
            None => 22,
        };
        let user = attrs
            .get("ansible_user")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let password = attrs
            .get("ansible_password")
            .and_then(Value::as_str)
            .map(str::to_string);
        let private_key_file = attrs
            .get("ansible_ssh_private_key_file")
            .and_then(Value::as_str)
            .map(str::to_string);
        let transport = match attrs.get("ansible_connection").and_then(Value::as_str) {
            Some("local") => Transport::Local,
            Some("ssh") | None => Transport::Ssh,
            Some(other) => {
                return Err(EngineError::InventoryInvalid(format!(
                    "host {name}: unknown ansible_connection '{other}'"
                )))
            }
        };

        const RECOGNIZED: &[&str] = &[
            "ansible_host",
            "ansible_port",
            "ansible_user",
            "ansible_password",
            "ansible_ssh_private_key_file",
            "ansible_connection",
        ];
        let vars = attrs
            .iter()
            .filter(|(k, _)| !RECOGNIZED.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(Host {
            name: name.to_string(),
            transport,
            address,
            port,
            user,
            password,
            private_key_file,
            vars,
        })
    }

    /// The attribute map that reproduces this host through [`Host::from_attrs`].
    /// Used when persisting dynamic hosts to the state store.
    pub fn to_attrs(&self) -> BTreeMap<String, Value> {
        let mut attrs = self.vars.clone();
        attrs.insert("ansible_host".into(), Value::String(self.address.clone()));
        attrs.insert("ansible_port".into(), Value::from(self.port));
        if !self.user.is_empty() {
            attrs.insert("ansible_user".into(), Value::String(self.user.clone()));
        }
        if let Some(password) = &self.password {
            attrs.insert("ansible_password".into(), Value::String(password.clone()));
        }
        if let Some(key) = &self.private_key_file {
            attrs.insert(
                "ansible_ssh_private_key_file".into(),
                Value::String(key.clone()),
            );
        }
        if self.transport == Transport::Local {
            attrs.insert("ansible_connection".into(), Value::String("local".into()));
        }
        attrs
    }

    pub fn is_local(&self) -> bool {
        self.transport == Transport::Local
    }

    /// A localhost entry for inventory-less runs.
    pub fn localhost() -> Self {
        Host {
            name: "localhost".into(),
            transport: Transport::Local,
            address: "127.0.0.1".into(),
            port: 22,
            user: String::new(),
            password: None,
            private_key_file: None,
            vars: BTreeMap::new(),
        }
    }
}

/// A named group of hosts with group-level vars and child groups.
#[derive(Clone, Debug, Default)]
pub struct HostGroup {
    pub name: String,
    /// Declaration-ordered host names; bodies live in the inventory host table.
    pub hosts: Vec<String>,
    pub vars: BTreeMap<String, Value>,
    pub children: Vec<String>,
}

/// What a call targets: one host, one group, or an explicit list of either.
#[derive(Clone, Debug)]
pub enum Selector {
    Name(String),
    Many(Vec<String>),
}

impl From<&str> for Selector {
    fn from(name: &str) -> Self {
        Selector::Name(name.to_string())
    }
}

impl From<Vec<String>> for Selector {
    fn from(names: Vec<String>) -> Self {
        Selector::Many(names)
    }
}

/// The inventory: declaration-ordered groups plus a host table.
#[derive(Clone, Debug, Default)]
pub struct Inventory {
    groups: Vec<HostGroup>,
    hosts: BTreeMap<String, Host>,
    /// Declaration order across the whole document, for the `all` group.
    order: Vec<String>,
}

impl Inventory {
    /// A one-host local inventory, used when no inventory is configured.
    pub fn localhost() -> Self {
        let mut inventory = Inventory::default();
        let mut group = HostGroup {
            name: "all".into(),
            ..HostGroup::default()
        };
        let host = Host::localhost();
        group.hosts.push(host.name.clone());
        inventory.order.push(host.name.clone());
        inventory.hosts.insert(host.name.clone(), host);
        inventory.groups.push(group);
        inventory
    }

    /// Loads an inventory from a file path. Executable files are invoked
    /// with `--list`; otherwise the content is parsed as JSON when it
    /// starts with `{`, else YAML.
    pub async fn load(path: &Path) -> Result<Self> {
        if is_executable(path) {
            let output = tokio::process::Command::new(path)
                .arg("--list")
                .output()
                .await
                .map_err(|e| {
                    EngineError::InventoryInvalid(format!(
                        "executable inventory {} failed to start: {e}",
                        path.display()
                    ))
                })?;
            if !output.status.success() {
                return Err(EngineError::InventoryInvalid(format!(
                    "executable inventory {} exited with {}",
                    path.display(),
                    output.status
                )));
            }
            let value: Value = serde_json::from_slice(&output.stdout).map_err(|e| {
                EngineError::InventoryInvalid(format!("executable inventory output: {e}"))
            })?;
            return Self::from_value(&value);
        }

        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            EngineError::InventoryInvalid(format!("cannot read {}: {e}", path.display()))
        })?;
        if content.trim_start().starts_with('{') {
            let value: Value = serde_json::from_str(&content)
                .map_err(|e| EngineError::InventoryInvalid(e.to_string()))?;
            Self::from_value(&value)
        } else {
            let value: Value = serde_yaml::from_str(&content)
                .map_err(|e| EngineError::InventoryInvalid(e.to_string()))?;
            Self::from_value(&value)
        }
    }

    /// Builds an inventory from a parsed document. Accepts both the YAML
    /// shape (`group -> {hosts: {name -> attrs}}`) and the `--list` JSON
    /// shape (`group -> {hosts: [name]}` with `_meta.hostvars`).
    pub fn from_value(data: &Value) -> Result<Self> {
        let top = data.as_object().ok_or_else(|| {
            EngineError::InventoryInvalid("top level must be a mapping of groups".into())
        })?;
        let hostvars = top
            .get("_meta")
            .and_then(|m| m.get("hostvars"))
            .and_then(Value::as_object);

        let mut inventory = Inventory::default();
        for (group_name, group_data) in top {
            if group_name == "_meta" {
                continue;
            }
            let body = group_data.as_object().ok_or_else(|| {
                EngineError::InventoryInvalid(format!("group {group_name} must be a mapping"))
            })?;
            for key in body.keys() {
                if !matches!(key.as_str(), "hosts" | "vars" | "children") {
                    return Err(EngineError::InventoryInvalid(format!(
                        "group {group_name}: unknown key '{key}'"
                    )));
                }
            }

            let mut group = HostGroup {
                name: group_name.clone(),
                ..HostGroup::default()
            };

            match body.get("hosts") {
                // YAML shape: hosts is a mapping of name -> attrs.
                Some(Value::Object(map)) => {
                    for (host_name, host_data) in map {
                        let attrs = attrs_from_value(group_name, host_name, host_data)?;
                        inventory.insert_host(&mut group, host_name, &attrs)?;
                    }
                }
                // JSON --list shape: hosts is a list of names, attrs under _meta.
                Some(Value::Array(names)) => {
                    for name in names {
                        let host_name = name.as_str().ok_or_else(|| {
                            EngineError::InventoryInvalid(format!(
                                "group {group_name}: host names must be strings"
                            ))
                        })?;
                        let data = hostvars
                            .and_then(|hv| hv.get(host_name))
                            .cloned()
                            .unwrap_or_else(|| Value::Object(Default::default()));
                        let attrs = attrs_from_value(group_name, host_name, &data)?;
                        inventory.insert_host(&mut group, host_name, &attrs)?;
                    }
                }
                Some(other) => {
                    return Err(EngineError::InventoryInvalid(format!(
                        "group {group_name}: hosts must be a mapping or list, got {other}"
                    )))
                }
                None => {}
            }

            if let Some(vars) = body.get("vars") {
                let map = vars.as_object().ok_or_else(|| {
                    EngineError::InventoryInvalid(format!("group {group_name}: vars must be a mapping"))
                })?;
                group.vars = map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            }
            if let Some(children) = body.get("children") {
                group.children = match children {
                    Value::Array(list) => list
                        .iter()
                        .map(|c| {
                            c.as_str().map(str::to_string).ok_or_else(|| {
                                EngineError::InventoryInvalid(format!(
                                    "group {group_name}: children must be strings"
                                ))
                            })
                        })
                        .collect::<Result<_>>()?,
                    Value::Object(map) => map.keys().cloned().collect(),
                    other => {
                        return Err(EngineError::InventoryInvalid(format!(
                            "group {group_name}: children must be a list, got {other}"
                        )))
                    }
                };
            }

            inventory.groups.push(group);
        }

        Ok(inventory)
    }

    fn insert_host(
        &mut self,
        group: &mut HostGroup,
        name: &str,
        attrs: &BTreeMap<String, Value>,
    ) -> Result<()> {
        let host = Host::from_attrs(name, attrs)?;
        if !self.hosts.contains_key(name) {
            self.order.push(name.to_string());
        }
        self.hosts.insert(name.to_string(), host);
        group.hosts.push(name.to_string());
        Ok(())
    }

    /// Inserts or updates a host outside any named group (it remains part of
    /// `all`). Used for dynamically provisioned hosts.
    pub fn add_host(&mut self, name: &str, attrs: &BTreeMap<String, Value>) -> Result<Host> {
        let host = Host::from_attrs(name, attrs)?;
        if !self.hosts.contains_key(name) {
            self.order.push(name.to_string());
        }
        self.hosts.insert(name.to_string(), host.clone());
        Ok(host)
    }

    pub fn group_names(&self) -> Vec<String> {
        self.groups.iter().map(|g| g.name.clone()).collect()
    }

    pub fn host(&self, name: &str) -> Option<&Host> {
        self.hosts.get(name)
    }

    /// All hosts in declaration order.
    pub fn all_hosts(&self) -> Vec<Host> {
        self.order
            .iter()
            .filter_map(|name| self.hosts.get(name).cloned())
            .collect()
    }

    /// Resolves a selector to an ordered, de-duplicated host list. Group
    /// names resolve transitively through `children`; a bare name that is
    /// not a group must be a host.
    pub fn hosts(&self, selector: &Selector) -> Result<Vec<Host>> {
        let names = match selector {
            Selector::Name(name) => vec![name.clone()],
            Selector::Many(names) => names.clone(),
        };

        let mut seen = std::collections::BTreeSet::new();
        let mut resolved = Vec::new();
        for name in names {
            self.resolve_name(&name, &mut seen, &mut resolved, 0)?;
        }
        Ok(resolved)
    }

    fn resolve_name(
        &self,
        name: &str,
        seen: &mut std::collections::BTreeSet<String>,
        out: &mut Vec<Host>,
        depth: usize,
    ) -> Result<()> {
        // Children cycles would otherwise recurse forever.
        if depth > 32 {
            return Err(EngineError::InventoryInvalid(format!(
                "group nesting too deep resolving '{name}'"
            )));
        }
        if name == "all" {
            for host in self.all_hosts() {
                if seen.insert(host.name.clone()) {
                    out.push(host);
                }
            }
            return Ok(());
        }
        if let Some(group) = self.groups.iter().find(|g| g.name == name) {
            for host_name in &group.hosts {
                if let Some(host) = self.hosts.get(host_name) {
                    if seen.insert(host.name.clone()) {
                        out.push(host.clone());
                    }
                }
            }
            let children = group.children.clone();
            for child in children {
                self.resolve_name(&child, seen, out, depth + 1)?;
            }
            return Ok(());
        }
        if let Some(host) = self.hosts.get(name) {
            if seen.insert(host.name.clone()) {
                out.push(host.clone());
            }
            return Ok(());
        }
        Err(EngineError::InventoryInvalid(format!(
            "unknown host or group '{name}'"
        )))
    }
}

fn attrs_from_value(
    group: &str,
    host: &str,
    data: &Value,
) -> Result<BTreeMap<String, Value>> {
    match data {
        Value::Object(map) => Ok(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
        Value::Null => Ok(BTreeMap::new()),
        other => Err(EngineError::InventoryInvalid(format!(
            "group {group}, host {host}: attributes must be a mapping, got {other}"
        ))),
    }
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    false
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    match (path.extension().and_then(|e| e.to_str()), path.metadata()) {
        (Some("yml" | "yaml" | "json"), _) => false,
        (_, Ok(meta)) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        _ => false,
    }
}

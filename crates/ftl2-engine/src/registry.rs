//! Module registry: name resolution and discovery.
//!
//! Resolution precedence: explicit user module directories, then the
//! native fast-path table, then the built-in collection root. A dotted
//! FQCN (`ns.coll.name`) maps onto collection directory layout; a bare
//! name is looked up directly.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::bundle::{parse_metadata, resolve_module_file};
use crate::error::{EngineError, Result};
use crate::modules::{builtin_modules, NativeModule, ParamDoc};

/// How a resolved module executes.
#[derive(Clone)]
pub enum ModuleKind {
    /// In-process fast path.
    Native(Arc<dyn NativeModule>),
    /// Packaged into a bundle and executed through a gate.
    Bundled(PathBuf),
}

impl std::fmt::Debug for ModuleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModuleKind::Native(m) => write!(f, "Native({})", m.fqcn()),
            ModuleKind::Bundled(path) => write!(f, "Bundled({})", path.display()),
        }
    }
}

/// A resolved module reference.
#[derive(Clone, Debug)]
pub struct ModuleDescriptor {
    pub fqcn: String,
    pub kind: ModuleKind,
    pub dependencies: Vec<String>,
}

/// Parameter-shape documentation for `describe`.
#[derive(Clone, Debug)]
pub struct ModuleDocs {
    pub fqcn: String,
    pub docs: String,
    pub params: Vec<ParamDoc>,
}

pub struct ModuleRegistry {
    user_paths: Vec<PathBuf>,
    collection_root: Option<PathBuf>,
    natives: BTreeMap<&'static str, Arc<dyn NativeModule>>,
}

impl ModuleRegistry {
    pub fn new(user_paths: Vec<PathBuf>, collection_root: Option<PathBuf>) -> Self {
        let natives = builtin_modules()
            .into_iter()
            .map(|m| (m.fqcn(), m))
            .collect();
        Self {
            user_paths,
            collection_root,
            natives,
        }
    }

    /// All directories a bundle build should search, in precedence order.
    pub fn search_paths(&self) -> Vec<PathBuf> {
        let mut paths = self.user_paths.clone();
        if let Some(root) = &self.collection_root {
            paths.push(root.clone());
        }
        paths
    }

    /// Resolves a dotted or bare name to a descriptor.
    pub fn resolve(&self, name: &str) -> Result<ModuleDescriptor> {
        if let Some(path) = resolve_module_file(&self.user_paths, name) {
            return Ok(bundled_descriptor(name, path));
        }
        if let Some(native) = self.natives.get(name) {
            return Ok(ModuleDescriptor {
                fqcn: name.to_string(),
                kind: ModuleKind::Native(Arc::clone(native)),
                dependencies: Vec::new(),
            });
        }
        if let Some(root) = &self.collection_root {
            if let Some(path) = resolve_module_file(std::slice::from_ref(root), name) {
                return Ok(bundled_descriptor(name, path));
            }
        }
        Err(EngineError::BundleBuildFailed(format!(
            "module not found: {name}"
        )))
    }

    /// Native names plus bare modules discoverable in the search paths.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.natives.keys().map(|n| n.to_string()).collect();
        for dir in self.search_paths() {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().is_some_and(|e| e == "py") {
                    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                        if !names.iter().any(|n| n == stem) {
                            names.push(stem.to_string());
                        }
                    }
                }
            }
        }
        names.sort();
        names
    }

    /// Parameter documentation for discovery tooling. Bundled modules have
    /// no static schema; their entry reports dependencies instead.
    pub fn describe(&self, name: &str) -> Result<ModuleDocs> {
        let descriptor = self.resolve(name)?;
        match &descriptor.kind {
            ModuleKind::Native(native) => Ok(ModuleDocs {
                fqcn: descriptor.fqcn,
                docs: native.docs().to_string(),
                params: native.params().to_vec(),
            }),
            ModuleKind::Bundled(path) => Ok(ModuleDocs {
                fqcn: descriptor.fqcn,
                docs: format!(
                    "bundled module at {} (dependencies: {})",
                    path.display(),
                    if descriptor.dependencies.is_empty() {
                        "none".to_string()
                    } else {
                        descriptor.dependencies.join(", ")
                    }
                ),
                params: Vec::new(),
            }),
        }
    }
}

fn bundled_descriptor(name: &str, path: PathBuf) -> ModuleDescriptor {
    let dependencies = std::fs::read_to_string(&path)
        .map(|source| parse_metadata(&source).requires)
        .unwrap_or_default();
    ModuleDescriptor {
        fqcn: name.to_string(),
        kind: ModuleKind::Bundled(path),
        dependencies,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree_with(name: &str, content: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(format!("{name}.py")), content).unwrap();
        dir
    }

    #[test]
    fn native_table_resolves_builtins() {
        let registry = ModuleRegistry::new(Vec::new(), None);
        let descriptor = registry.resolve("ping").unwrap();
        assert!(matches!(descriptor.kind, ModuleKind::Native(_)));
    }

    #[test]
    fn user_path_shadows_native_module() {
        let dir = tree_with("ping", "print('custom ping')\n");
        let registry = ModuleRegistry::new(vec![dir.path().to_path_buf()], None);
        let descriptor = registry.resolve("ping").unwrap();
        assert!(matches!(descriptor.kind, ModuleKind::Bundled(_)));
    }

    #[test]
    fn collection_root_is_last_resort() {
        let root = tempfile::tempdir().unwrap();
        let coll = root.path().join("acme/web");
        std::fs::create_dir_all(&coll).unwrap();
        std::fs::write(coll.join("vhost.py"), "# ftl2: requires = helper\n").unwrap();

        let registry = ModuleRegistry::new(Vec::new(), Some(root.path().to_path_buf()));
        let descriptor = registry.resolve("acme.web.vhost").unwrap();
        assert!(matches!(descriptor.kind, ModuleKind::Bundled(_)));
        assert_eq!(descriptor.dependencies, ["helper"]);
    }

    #[test]
    fn unknown_module_is_an_error() {
        let registry = ModuleRegistry::new(Vec::new(), None);
        let err = registry.resolve("does.not.exist").unwrap_err();
        assert!(matches!(err, EngineError::BundleBuildFailed(_)));
    }

    #[test]
    fn list_merges_natives_and_disk() {
        let dir = tree_with("deploy", "pass\n");
        let registry = ModuleRegistry::new(vec![dir.path().to_path_buf()], None);
        let names = registry.list();
        assert!(names.contains(&"ping".to_string()));
        assert!(names.contains(&"deploy".to_string()));
    }

    #[test]
    fn describe_native_has_param_docs() {
        let registry = ModuleRegistry::new(Vec::new(), None);
        let docs = registry.describe("file").unwrap();
        assert!(docs.params.iter().any(|p| p.name == "path" && p.required));
    }
}

//! Bundle builder: content-addressed module archives.
//!
//! A bundle is a self-contained gzip tarball holding module code, its
//! auxiliary libraries, a manifest, and the entry stub that turns the
//! archive into a gate on a target host. Bundles are keyed by a
//! fingerprint computed from their inputs, so two bundles with the same
//! fingerprint are byte-equivalent and interchangeable, and the disk cache
//! can be shared across processes.
//!
//! Modules declare auxiliary libraries in a comment header:
//!
//! ```text
//! # ftl2: requires = helper_net, helper_fs
//! # ftl2: python = >=3.8
//! ```
//!
//! `requires` names resolve to `ftl2_lib/<name>.py` under the builder's
//! search paths and are scanned transitively for their own headers.

mod stub;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{EngineError, Result};

pub use stub::{ENTRY_STUB, STUB_VERSION};

/// What the target can run; participates in the fingerprint so one host's
/// bundle is never reused against an incompatible interpreter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetProfile {
    pub interpreter: String,
    pub platform: String,
}

impl Default for TargetProfile {
    fn default() -> Self {
        Self {
            interpreter: "python3".into(),
            platform: "linux".into(),
        }
    }
}

/// A built (or cache-loaded) bundle.
#[derive(Clone, Debug)]
pub struct Bundle {
    pub fingerprint: String,
    pub data: Arc<Vec<u8>>,
}

impl Bundle {
    /// File name under the cache directory and the remote gate cache.
    pub fn archive_name(&self) -> String {
        format!("{}.tar.gz", self.fingerprint)
    }
}

/// Metadata parsed from a module's `# ftl2:` header lines.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ModuleMetadata {
    pub requires: Vec<String>,
    pub python: Option<String>,
}

/// Parses `# ftl2: key = value` lines out of module source.
pub fn parse_metadata(source: &str) -> ModuleMetadata {
    let mut meta = ModuleMetadata::default();
    for line in source.lines() {
        let Some(rest) = line.trim_start().strip_prefix("# ftl2:") else {
            continue;
        };
        let Some((key, value)) = rest.split_once('=') else {
            continue;
        };
        match key.trim() {
            "requires" => {
                meta.requires.extend(
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string),
                );
            }
            "python" => meta.python = Some(value.trim().to_string()),
            _ => {}
        }
    }
    meta
}

/// Resolves an FQCN to a module file under the given search paths.
/// `ns.coll.name` maps to `<dir>/<ns>/<coll>/<name>.py`, a bare name to
/// `<dir>/<name>.py`. First search path wins.
pub fn resolve_module_file(search_paths: &[PathBuf], fqcn: &str) -> Option<PathBuf> {
    let relative: PathBuf = if fqcn.contains('.') {
        let mut parts: Vec<&str> = fqcn.split('.').collect();
        let name = parts.pop()?;
        let mut path: PathBuf = parts.iter().collect();
        path.push(format!("{name}.py"));
        path
    } else {
        PathBuf::from(format!("{fqcn}.py"))
    };
    search_paths
        .iter()
        .map(|dir| dir.join(&relative))
        .find(|candidate| candidate.is_file())
}

#[derive(Serialize)]
struct Manifest<'a> {
    stub_version: &'a str,
    fingerprint: &'a str,
    target: ManifestTarget<'a>,
    modules: Vec<&'a str>,
    dependencies: Vec<&'a str>,
}

#[derive(Serialize)]
struct ManifestTarget<'a> {
    interpreter: &'a str,
    platform: &'a str,
}

struct Prepared {
    fingerprint: String,
    /// fqcn -> (bare file name, source bytes), sorted by fqcn.
    modules: BTreeMap<String, (String, Vec<u8>)>,
    /// dependency name -> source bytes, sorted by name.
    dependencies: BTreeMap<String, Vec<u8>>,
    profile: TargetProfile,
}

/// Builds and caches bundles. Concurrent builds of the same fingerprint
/// deduplicate: one builds, the others wait on the per-fingerprint lock
/// and then read the cache. A lock file guards the same invariant across
/// processes sharing the cache directory.
pub struct BundleBuilder {
    search_paths: Vec<PathBuf>,
    cache_dir: PathBuf,
    building: tokio::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

const LOCK_WAIT: Duration = Duration::from_millis(50);
const LOCK_TIMEOUT: Duration = Duration::from_secs(30);

impl BundleBuilder {
    pub fn new(search_paths: Vec<PathBuf>, cache_dir: PathBuf) -> Self {
        Self {
            search_paths,
            cache_dir,
            building: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Resolves, fingerprints, and packages the given modules for the
    /// target, returning the cached archive when one exists.
    pub async fn build(&self, fqcns: &[String], profile: &TargetProfile) -> Result<Bundle> {
        let search_paths = self.search_paths.clone();
        let fqcns: Vec<String> = fqcns.to_vec();
        let profile = profile.clone();
        let prepared = tokio::task::spawn_blocking(move || prepare(&search_paths, &fqcns, profile))
            .await
            .map_err(|e| EngineError::BundleBuildFailed(e.to_string()))??;

        let fingerprint = prepared.fingerprint.clone();
        let guard = self.build_lock(&fingerprint).await;
        let _guard = guard.lock().await;

        let cache_path = self.cache_dir.join(format!("{fingerprint}.tar.gz"));
        if let Some(bundle) = self.try_cached(&cache_path, &fingerprint).await? {
            tracing::debug!(%fingerprint, "bundle cache hit");
            return Ok(bundle);
        }

        tokio::fs::create_dir_all(&self.cache_dir).await?;
        let lock_path = self.cache_dir.join(format!("{fingerprint}.lock"));
        let file_lock = acquire_file_lock(&lock_path).await?;

        // Another process may have finished while we waited on the lock.
        if let Some(bundle) = self.try_cached(&cache_path, &fingerprint).await? {
            drop(file_lock);
            return Ok(bundle);
        }

        let data = tokio::task::spawn_blocking(move || package(&prepared))
            .await
            .map_err(|e| EngineError::BundleBuildFailed(e.to_string()))??;

        write_bytes_atomic(&cache_path, &data)?;
        drop(file_lock);
        tracing::info!(%fingerprint, size = data.len(), "bundle built");

        Ok(Bundle {
            fingerprint,
            data: Arc::new(data),
        })
    }

    async fn try_cached(&self, cache_path: &Path, fingerprint: &str) -> Result<Option<Bundle>> {
        match tokio::fs::read(cache_path).await {
            Ok(data) => Ok(Some(Bundle {
                fingerprint: fingerprint.to_string(),
                data: Arc::new(data),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn build_lock(&self, fingerprint: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut building = self.building.lock().await;
        Arc::clone(
            building
                .entry(fingerprint.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }
}

fn prepare(
    search_paths: &[PathBuf],
    fqcns: &[String],
    profile: TargetProfile,
) -> Result<Prepared> {
    let unique: BTreeSet<&String> = fqcns.iter().collect();
    let mut modules = BTreeMap::new();
    let mut dependencies = BTreeMap::new();

    for fqcn in unique {
        let path = resolve_module_file(search_paths, fqcn).ok_or_else(|| {
            EngineError::BundleBuildFailed(format!("module not found: {fqcn}"))
        })?;
        let source = std::fs::read(&path)?;
        collect_dependencies(search_paths, fqcn, &source, &mut dependencies)?;
        let file_name = format!("{}.py", fqcn.rsplit('.').next().unwrap_or(fqcn));
        modules.insert(fqcn.clone(), (file_name, source));
    }

    let fingerprint = compute_fingerprint(&modules, &dependencies, &profile);
    Ok(Prepared {
        fingerprint,
        modules,
        dependencies,
        profile,
    })
}

fn collect_dependencies(
    search_paths: &[PathBuf],
    owner: &str,
    source: &[u8],
    out: &mut BTreeMap<String, Vec<u8>>,
) -> Result<()> {
    let meta = parse_metadata(&String::from_utf8_lossy(source));
    for name in meta.requires {
        if out.contains_key(&name) {
            continue;
        }
        let path = search_paths
            .iter()
            .map(|dir| dir.join("ftl2_lib").join(format!("{name}.py")))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| {
                EngineError::BundleBuildFailed(format!(
                    "{owner}: auxiliary library not found: {name}"
                ))
            })?;
        let dep_source = std::fs::read(&path)?;
        out.insert(name.clone(), dep_source.clone());
        collect_dependencies(search_paths, &name, &dep_source, out)?;
    }
    Ok(())
}

/// Stable over input order: modules and dependencies are iterated in
/// sorted order, with separators so field boundaries cannot alias.
fn compute_fingerprint(
    modules: &BTreeMap<String, (String, Vec<u8>)>,
    dependencies: &BTreeMap<String, Vec<u8>>,
    profile: &TargetProfile,
) -> String {
    let mut hasher = Sha256::new();
    for (fqcn, (_, source)) in modules {
        hasher.update(fqcn.as_bytes());
        hasher.update([0]);
        hasher.update(source);
        hasher.update([0]);
    }
    for name in dependencies.keys() {
        hasher.update(name.as_bytes());
        hasher.update([0]);
    }
    hasher.update(STUB_VERSION.as_bytes());
    hasher.update([0]);
    hasher.update(profile.interpreter.as_bytes());
    hasher.update([0]);
    hasher.update(profile.platform.as_bytes());
    hex::encode(hasher.finalize())
}

/// Packages the archive deterministically: fixed entry metadata, sorted
/// paths, and a fixed gzip header, so identical inputs give identical
/// bytes.
fn package(prepared: &Prepared) -> Result<Vec<u8>> {
    let module_names: Vec<&str> = prepared
        .modules
        .keys()
        .map(String::as_str)
        .collect();
    let dependency_names: Vec<&str> = prepared
        .dependencies
        .keys()
        .map(String::as_str)
        .collect();
    let manifest = Manifest {
        stub_version: STUB_VERSION,
        fingerprint: &prepared.fingerprint,
        target: ManifestTarget {
            interpreter: &prepared.profile.interpreter,
            platform: &prepared.profile.platform,
        },
        modules: module_names,
        dependencies: dependency_names,
    };
    let manifest_bytes = serde_json::to_vec_pretty(&manifest)
        .map_err(|e| EngineError::BundleBuildFailed(e.to_string()))?;

    let mut entries: Vec<(String, u32, &[u8])> = Vec::new();
    entries.push(("__main__.py".into(), 0o755, ENTRY_STUB.as_bytes()));
    entries.push(("manifest.json".into(), 0o644, &manifest_bytes));
    for (name, source) in &prepared.dependencies {
        entries.push((format!("ftl2_lib/{name}.py"), 0o644, source));
    }
    for (file_name, source) in prepared.modules.values() {
        entries.push((format!("modules/{file_name}"), 0o644, source));
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    let mut archive = tar::Builder::new(encoder);
    for (path, mode, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(mode);
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_cksum();
        archive
            .append_data(&mut header, &path, data)
            .map_err(|e| EngineError::BundleBuildFailed(format!("{path}: {e}")))?;
    }
    let encoder = archive
        .into_inner()
        .map_err(|e| EngineError::BundleBuildFailed(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| EngineError::BundleBuildFailed(e.to_string()))
}

fn write_bytes_atomic(path: &Path, data: &[u8]) -> Result<()> {
    use std::io::Write;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

struct FileLock {
    path: PathBuf,
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn acquire_file_lock(path: &Path) -> Result<FileLock> {
    let deadline = tokio::time::Instant::now() + LOCK_TIMEOUT;
    loop {
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(_) => {
                return Ok(FileLock {
                    path: path.to_path_buf(),
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if tokio::time::Instant::now() >= deadline {
                    return Err(EngineError::BundleBuildFailed(format!(
                        "timed out waiting for build lock {}",
                        path.display()
                    )));
                }
                tokio::time::sleep(LOCK_WAIT).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module_tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("deploy.py"),
            "# ftl2: requires = helper_net\nprint('deploy')\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("status.py"), "print('status')\n").unwrap();
        let lib = dir.path().join("ftl2_lib");
        std::fs::create_dir_all(&lib).unwrap();
        std::fs::write(
            lib.join("helper_net.py"),
            "# ftl2: requires = helper_base\nNET = 1\n",
        )
        .unwrap();
        std::fs::write(lib.join("helper_base.py"), "BASE = 1\n").unwrap();
        let collection = dir.path().join("acme/web");
        std::fs::create_dir_all(&collection).unwrap();
        std::fs::write(collection.join("vhost.py"), "print('vhost')\n").unwrap();
        dir
    }

    fn builder(tree: &tempfile::TempDir, cache: &tempfile::TempDir) -> BundleBuilder {
        BundleBuilder::new(
            vec![tree.path().to_path_buf()],
            cache.path().to_path_buf(),
        )
    }

    #[test]
    fn metadata_header_parsing() {
        let meta = parse_metadata(
            "#!/usr/bin/env python3\n# ftl2: requires = a, b ,c\n# ftl2: python = >=3.9\nx = 1\n",
        );
        assert_eq!(meta.requires, ["a", "b", "c"]);
        assert_eq!(meta.python.as_deref(), Some(">=3.9"));
        assert_eq!(parse_metadata("x = 1\n"), ModuleMetadata::default());
    }

    #[test]
    fn fqcn_maps_to_collection_path() {
        let tree = module_tree();
        let paths = vec![tree.path().to_path_buf()];
        let found = resolve_module_file(&paths, "acme.web.vhost").unwrap();
        assert!(found.ends_with("acme/web/vhost.py"));
        assert!(resolve_module_file(&paths, "deploy").is_some());
        assert!(resolve_module_file(&paths, "missing").is_none());
    }

    #[tokio::test]
    async fn fingerprint_is_order_independent() {
        let tree = module_tree();
        let cache_a = tempfile::tempdir().unwrap();
        let cache_b = tempfile::tempdir().unwrap();
        let profile = TargetProfile::default();

        let ab = builder(&tree, &cache_a)
            .build(&["deploy".into(), "status".into()], &profile)
            .await
            .unwrap();
        let ba = builder(&tree, &cache_b)
            .build(&["status".into(), "deploy".into()], &profile)
            .await
            .unwrap();
        assert_eq!(ab.fingerprint, ba.fingerprint);
        assert_eq!(ab.data, ba.data);
    }

    #[tokio::test]
    async fn fingerprint_tracks_profile_and_content() {
        let tree = module_tree();
        let cache = tempfile::tempdir().unwrap();
        let builder = builder(&tree, &cache);

        let base = builder
            .build(&["status".into()], &TargetProfile::default())
            .await
            .unwrap();
        let other_interp = builder
            .build(
                &["status".into()],
                &TargetProfile {
                    interpreter: "python3.12".into(),
                    platform: "linux".into(),
                },
            )
            .await
            .unwrap();
        assert_ne!(base.fingerprint, other_interp.fingerprint);

        std::fs::write(tree.path().join("status.py"), "print('v2')\n").unwrap();
        let changed = builder
            .build(&["status".into()], &TargetProfile::default())
            .await
            .unwrap();
        assert_ne!(base.fingerprint, changed.fingerprint);
    }

    #[tokio::test]
    async fn cache_hit_returns_identical_bytes() {
        let tree = module_tree();
        let cache = tempfile::tempdir().unwrap();
        let builder = builder(&tree, &cache);
        let profile = TargetProfile::default();

        let first = builder.build(&["deploy".into()], &profile).await.unwrap();
        let cache_file = cache.path().join(first.archive_name());
        assert!(cache_file.exists());

        let second = builder.build(&["deploy".into()], &profile).await.unwrap();
        assert_eq!(first.fingerprint, second.fingerprint);
        assert_eq!(first.data, second.data);
    }

    #[tokio::test]
    async fn transitive_dependencies_are_packaged() {
        let tree = module_tree();
        let cache = tempfile::tempdir().unwrap();
        let bundle = builder(&tree, &cache)
            .build(&["deploy".into()], &TargetProfile::default())
            .await
            .unwrap();

        let decoder = flate2::read::GzDecoder::new(bundle.data.as_slice());
        let mut archive = tar::Archive::new(decoder);
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();
        assert!(names.contains(&"__main__.py".to_string()));
        assert!(names.contains(&"manifest.json".to_string()));
        assert!(names.contains(&"modules/deploy.py".to_string()));
        assert!(names.contains(&"ftl2_lib/helper_net.py".to_string()));
        // helper_base comes in transitively through helper_net.
        assert!(names.contains(&"ftl2_lib/helper_base.py".to_string()));
    }

    #[tokio::test]
    async fn missing_module_fails_build() {
        let tree = module_tree();
        let cache = tempfile::tempdir().unwrap();
        let err = builder(&tree, &cache)
            .build(&["no_such_module".into()], &TargetProfile::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::BundleBuildFailed(_)));
    }

    #[tokio::test]
    async fn missing_dependency_names_the_owner() {
        let tree = module_tree();
        std::fs::write(
            tree.path().join("broken.py"),
            "# ftl2: requires = nonexistent_helper\n",
        )
        .unwrap();
        let cache = tempfile::tempdir().unwrap();
        let err = builder(&tree, &cache)
            .build(&["broken".into()], &TargetProfile::default())
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("broken"));
        assert!(msg.contains("nonexistent_helper"));
    }

    #[tokio::test]
    async fn concurrent_builds_share_one_archive() {
        let tree = module_tree();
        let cache = tempfile::tempdir().unwrap();
        let builder = Arc::new(builder(&tree, &cache));
        let profile = TargetProfile::default();

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let builder = Arc::clone(&builder);
                let profile = profile.clone();
                tokio::spawn(async move { builder.build(&["deploy".into()], &profile).await })
            })
            .collect();
        let mut fingerprints = BTreeSet::new();
        for task in tasks {
            let bundle = task.await.unwrap().unwrap();
            fingerprints.insert(bundle.fingerprint.clone());
        }
        assert_eq!(fingerprints.len(), 1);
        // The lock file must not leak past the build.
        let leftover: Vec<_> = std::fs::read_dir(cache.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|x| x == "lock"))
            .collect();
        assert!(leftover.is_empty());
    }
}

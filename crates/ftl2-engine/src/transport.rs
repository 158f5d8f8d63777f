//! Gate transport: getting a bundle onto a host and a gate process running.
//!
//! The engine talks to gates through [`GateLauncher`], a seam with two
//! production implementations: [`SshLauncher`] drives the system `ssh`
//! client as a subprocess (staging uploads stream the archive over stdin),
//! and [`LocalLauncher`] runs the gate as a direct child process for
//! `transport: local` hosts. Tests substitute scripted channels built on
//! in-memory duplex streams.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};

use crate::bundle::Bundle;
use crate::error::{EngineError, Result};
use crate::inventory::Host;

/// A live bidirectional stream to a gate process, plus ownership of the
/// process itself so the gate can be killed on teardown.
pub struct GateChannel {
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub child: Option<Child>,
}

impl GateChannel {
    /// Wraps an in-memory duplex pair; used by tests to script a gate peer.
    pub fn from_duplex(stream: tokio::io::DuplexStream) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            writer: Box::new(writer),
            reader: Box::new(reader),
            child: None,
        }
    }
}

/// Stages bundles and launches gate processes on one class of host.
#[async_trait]
pub trait GateLauncher: Send + Sync {
    /// Makes the bundle archive present and unpacked under the host's gate
    /// cache; skips the upload when the fingerprint already exists there.
    async fn stage(&self, host: &Host, bundle: &Bundle) -> Result<()>;

    /// Starts the gate process for a staged bundle and returns its streams.
    async fn launch(&self, host: &Host, fingerprint: &str, interpreter: &str)
        -> Result<GateChannel>;
}

/// Runs gates over the system `ssh` client. One exec per operation; the
/// launched `--rpc` process is the long-lived session.
pub struct SshLauncher {
    remote_cache_dir: String,
}

impl SshLauncher {
    pub fn new(remote_cache_dir: impl Into<String>) -> Self {
        Self {
            remote_cache_dir: remote_cache_dir.into(),
        }
    }

    fn base_command(&self, host: &Host) -> Command {
        // sshpass bridges password auth onto the system client; key and
        // agent auth pass straight through.
        let mut cmd = if host.password.is_some() {
            let mut cmd = Command::new("sshpass");
            cmd.arg("-e").arg("ssh");
            cmd
        } else {
            Command::new("ssh")
        };
        if let Some(password) = &host.password {
            cmd.env("SSHPASS", password);
        }
        cmd.arg("-o").arg("BatchMode=no");
        cmd.arg("-p").arg(host.port.to_string());
        if let Some(key) = &host.private_key_file {
            cmd.arg("-i").arg(key);
        }
        if host.user.is_empty() {
            cmd.arg(&host.address);
        } else {
            cmd.arg(format!("{}@{}", host.user, host.address));
        }
        cmd.kill_on_drop(true);
        cmd
    }

    async fn exec(&self, host: &Host, script: &str, stdin: Option<&[u8]>) -> Result<i32> {
        let mut cmd = self.base_command(host);
        cmd.arg(script);
        cmd.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| EngineError::TransportLost(format!("{}: {e}", host.name)))?;
        if let Some(bytes) = stdin {
            let mut handle = child.stdin.take().expect("piped stdin");
            handle
                .write_all(bytes)
                .await
                .map_err(|_| EngineError::TransportLost(host.name.clone()))?;
            drop(handle);
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(|_| EngineError::TransportLost(host.name.clone()))?;
        if !output.stderr.is_empty() {
            tracing::debug!(
                host = %host.name,
                stderr = %String::from_utf8_lossy(&output.stderr),
                "ssh exec stderr"
            );
        }
        Ok(output.status.code().unwrap_or(-1))
    }
}

#[async_trait]
impl GateLauncher for SshLauncher {
    async fn stage(&self, host: &Host, bundle: &Bundle) -> Result<()> {
        let dir = &self.remote_cache_dir;
        let archive = format!("{dir}/{}", bundle.archive_name());
        let unpacked = format!("{dir}/{}", bundle.fingerprint);

        // The manifest check catches a stale or truncated cache entry at
        // the matching path; failing it forces one clean re-upload.
        let check = format!(
            "test -f {archive} && grep -q {fp} {unpacked}/manifest.json",
            fp = bundle.fingerprint
        );
        if self.exec(host, &check, None).await? == 0 {
            tracing::debug!(host = %host.name, fingerprint = %bundle.fingerprint, "bundle already staged");
            return Ok(());
        }

        tracing::info!(
            host = %host.name,
            fingerprint = %bundle.fingerprint,
            size = bundle.data.len(),
            "staging bundle"
        );
        let upload = format!(
            "mkdir -p {dir} && rm -rf {unpacked} && cat > {archive}.part \
             && mv {archive}.part {archive} \
             && mkdir -p {unpacked} && tar xzf {archive} -C {unpacked}"
        );
        let rc = self.exec(host, &upload, Some(&bundle.data)).await?;
        if rc != 0 {
            return Err(EngineError::TransportLost(format!(
                "{}: bundle staging exited {rc}",
                host.name
            )));
        }
        Ok(())
    }

    async fn launch(
        &self,
        host: &Host,
        fingerprint: &str,
        interpreter: &str,
    ) -> Result<GateChannel> {
        let dir = &self.remote_cache_dir;
        let mut cmd = self.base_command(host);
        cmd.arg(format!("{interpreter} {dir}/{fingerprint}/__main__.py --rpc"));
        spawn_gate(cmd, &host.name)
    }
}

/// Runs gates as direct children of the controller. The "remote" cache is
/// a local directory; staging is just unpacking.
pub struct LocalLauncher {
    cache_dir: PathBuf,
}

impl LocalLauncher {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self { cache_dir }
    }

    fn gate_dir(&self, fingerprint: &str) -> PathBuf {
        self.cache_dir.join(fingerprint)
    }
}

#[async_trait]
impl GateLauncher for LocalLauncher {
    async fn stage(&self, _host: &Host, bundle: &Bundle) -> Result<()> {
        let dir = self.gate_dir(&bundle.fingerprint);
        let manifest_ok = std::fs::read_to_string(dir.join("manifest.json"))
            .map(|m| m.contains(&bundle.fingerprint))
            .unwrap_or(false);
        if manifest_ok {
            return Ok(());
        }
        if dir.exists() {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        tokio::fs::create_dir_all(&dir).await?;
        let data = std::sync::Arc::clone(&bundle.data);
        let unpack_dir = dir.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let decoder = flate2::read::GzDecoder::new(data.as_slice());
            let mut archive = tar::Archive::new(decoder);
            archive.unpack(&unpack_dir)?;
            Ok(())
        })
        .await
        .map_err(|e| EngineError::BundleBuildFailed(e.to_string()))?
    }

    async fn launch(
        &self,
        host: &Host,
        fingerprint: &str,
        interpreter: &str,
    ) -> Result<GateChannel> {
        let entry = self.gate_dir(fingerprint).join("__main__.py");
        let mut cmd = Command::new(interpreter);
        cmd.arg(entry).arg("--rpc").kill_on_drop(true);
        spawn_gate(cmd, &host.name)
    }
}

/// Spawns the gate with piped stdio and a stderr drain feeding `tracing`.
fn spawn_gate(mut cmd: Command, host_name: &str) -> Result<GateChannel> {
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd
        .spawn()
        .map_err(|e| EngineError::TransportLost(format!("{host_name}: {e}")))?;

    let writer = child.stdin.take().expect("piped stdin");
    let reader = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");

    let stderr_host = host_name.to_string();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::warn!(host = %stderr_host, gate_stderr = %line);
        }
    });

    Ok(GateChannel {
        writer: Box::new(writer),
        reader: Box::new(reader),
        child: Some(child),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{BundleBuilder, TargetProfile};

    #[tokio::test]
    async fn local_stage_unpacks_once() {
        let tree = tempfile::tempdir().unwrap();
        std::fs::write(tree.path().join("noop.py"), "print('{}')\n").unwrap();
        let cache = tempfile::tempdir().unwrap();
        let builder = BundleBuilder::new(
            vec![tree.path().to_path_buf()],
            cache.path().join("bundles"),
        );
        let bundle = builder
            .build(&["noop".into()], &TargetProfile::default())
            .await
            .unwrap();

        let gates = tempfile::tempdir().unwrap();
        let launcher = LocalLauncher::new(gates.path().to_path_buf());
        let host = Host::localhost();
        launcher.stage(&host, &bundle).await.unwrap();

        let entry = gates.path().join(&bundle.fingerprint).join("__main__.py");
        assert!(entry.exists());
        let manifest = gates.path().join(&bundle.fingerprint).join("manifest.json");
        let manifest: serde_json::Value =
            serde_json::from_slice(&std::fs::read(manifest).unwrap()).unwrap();
        assert_eq!(manifest["fingerprint"], bundle.fingerprint.as_str());

        // Second stage is a no-op, not an error.
        launcher.stage(&host, &bundle).await.unwrap();
    }

    #[test]
    fn ssh_command_shape() {
        let mut host = Host::localhost();
        host.name = "web01".into();
        host.address = "203.0.113.5".into();
        host.port = 2222;
        host.user = "deploy".into();
        host.private_key_file = Some("/keys/deploy".into());

        let launcher = SshLauncher::new("~/.ftl2/gates");
        let cmd = launcher.base_command(&host);
        let std_cmd = cmd.as_std();
        assert_eq!(std_cmd.get_program(), "ssh");
        let args: Vec<String> = std_cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert!(args.contains(&"2222".to_string()));
        assert!(args.contains(&"/keys/deploy".to_string()));
        assert!(args.contains(&"deploy@203.0.113.5".to_string()));
    }

    #[test]
    fn password_hosts_route_through_sshpass() {
        let mut host = Host::localhost();
        host.address = "203.0.113.5".into();
        host.password = Some("secret".into());
        let launcher = SshLauncher::new("~/.ftl2/gates");
        let cmd = launcher.base_command(&host);
        assert_eq!(cmd.as_std().get_program(), "sshpass");
    }
}

// File: snapkeep/src/host/mod.rs
pub mod cache;

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

use crate::dataset::Filesystem;
use crate::errors::{Result, SnapkeepError};
use cache::{PropertyCache, PropertySet, PropertyValue};

/// An execution context: local, or remote reached through a secure shell,
/// plus a mapping from logical tool names to executable paths. Owns the
/// property cache for its endpoint.
pub struct Host {
    cmds: HashMap<String, String>,
    ssh_user: Option<String>,
    ssh_host: Option<String>,
    pub cache: PropertyCache,
}

impl Host {
    pub fn new(cmds: HashMap<String, String>, endpoint: Option<(String, String)>) -> Self {
        let mut resolved: HashMap<String, String> = [
            ("zfs", "zfs"),
            ("ssh", "ssh"),
            ("split", "split"),
            ("cat", "cat"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        resolved.extend(cmds);

        let (ssh_user, ssh_host) = match endpoint {
            Some((user, host)) => (Some(user), Some(host)),
            None => (None, None),
        };

        Self {
            cmds: resolved,
            ssh_user,
            ssh_host,
            cache: PropertyCache::default(),
        }
    }

    pub fn ssh_endpoint(&self) -> Option<(&str, &str)> {
        match (&self.ssh_user, &self.ssh_host) {
            (Some(user), Some(host)) => Some((user.as_str(), host.as_str())),
            _ => None,
        }
    }

    /// Builds the argv for a tool invocation on this host, wrapped through
    /// ssh for remote endpoints.
    pub fn command(&self, tool: &str, args: Vec<String>) -> Result<Vec<String>> {
        let path = self.tool_path(tool)?;
        let mut cmd = match self.ssh_endpoint() {
            Some((user, host)) => {
                let ssh = self.tool_path("ssh")?;
                vec![ssh, format!("{}@{}", user, host), path]
            }
            None => vec![path],
        };
        cmd.extend(args);
        debug!("Command: {}", cmd.join(" "));
        Ok(cmd)
    }

    /// Builds the argv for a tool that must run on the invoking machine
    /// regardless of where this host's datasets live. Segment and metadata
    /// files sit on the invoking machine, so the splitter and concatenator
    /// are never ssh-wrapped.
    pub fn command_local(&self, tool: &str, args: Vec<String>) -> Result<Vec<String>> {
        let mut cmd = vec![self.tool_path(tool)?];
        cmd.extend(args);
        debug!("Command: {}", cmd.join(" "));
        Ok(cmd)
    }

    fn tool_path(&self, tool: &str) -> Result<String> {
        self.cmds
            .get(tool)
            .cloned()
            .ok_or_else(|| SnapkeepError::Host(format!("'{}' does not have a path defined", tool)))
    }

    /// Runs a tool to completion and returns its stdout. A nonzero exit
    /// status is a host error carrying the tool's stderr.
    pub async fn output(&self, tool: &str, args: Vec<String>) -> Result<String> {
        let argv = self.command(tool, args)?;
        let output = Command::new(&argv[0])
            .args(&argv[1..])
            .output()
            .await
            .map_err(|e| SnapkeepError::Host(format!("failed to run {}: {}", argv[0], e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SnapkeepError::Host(format!(
                "'{}' exited with {}: {}",
                argv.join(" "),
                output.status,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Forces one bulk re-query of all datasets and properties on this host,
    /// replacing the cache wholesale.
    pub async fn refresh_cache(&self) -> Result<()> {
        let output = self
            .output(
                "zfs",
                vec![
                    "get".to_string(),
                    "all".to_string(),
                    "-H".to_string(),
                    "-p".to_string(),
                    "-o".to_string(),
                    "name,property,value".to_string(),
                ],
            )
            .await?;

        let mut entries: HashMap<String, PropertySet> = HashMap::new();
        for line in output.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let mut fields = line.splitn(3, '\t');
            let (Some(name), Some(property), Some(value)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            entries
                .entry(name.to_string())
                .or_default()
                .insert(property.to_string(), PropertyValue::parse(value));
        }
        self.cache.replace(entries).await;
        Ok(())
    }

    pub async fn ensure_cache(&self) -> Result<()> {
        if !self.cache.is_loaded().await {
            self.refresh_cache().await?;
        }
        Ok(())
    }

    pub async fn property(&self, dataset: &str, property: &str) -> Result<Option<PropertyValue>> {
        self.ensure_cache().await?;
        Ok(self.cache.get(dataset, property).await)
    }

    /// Enumerates filesystems on a host, filtered by include/exclude glob
    /// patterns over their names.
    pub async fn filesystems(
        host: &Arc<Host>,
        include: &[String],
        exclude: &[String],
    ) -> Result<Vec<Filesystem>> {
        let include = compile_patterns(include)?;
        let exclude = compile_patterns(exclude)?;

        let output = host
            .output(
                "zfs",
                vec![
                    "list".to_string(),
                    "-H".to_string(),
                    "-p".to_string(),
                    "-o".to_string(),
                    "name".to_string(),
                    "-t".to_string(),
                    "filesystem".to_string(),
                ],
            )
            .await?;

        let mut filesystems = Vec::new();
        for name in output.lines() {
            let name = name.trim();
            if name.is_empty() {
                continue;
            }

            if let Some(pattern) = exclude.iter().find(|p| p.matches(name)) {
                info!("'{}' is excluded by pattern '{}'", name, pattern);
                continue;
            }

            if include.is_empty() || include.iter().any(|p| p.matches(name)) {
                filesystems.push(Filesystem::new(Arc::clone(host), name));
            }
        }
        Ok(filesystems)
    }

    /// Resolves a single filesystem by name, `None` when it does not exist.
    pub async fn filesystem(host: &Arc<Host>, name: &str) -> Result<Option<Filesystem>> {
        let filesystems = Host::filesystems(host, &[name.to_string()], &[]).await?;
        Ok(filesystems.into_iter().next())
    }
}

fn compile_patterns(patterns: &[String]) -> Result<Vec<glob::Pattern>> {
    patterns
        .iter()
        .map(|p| {
            glob::Pattern::new(p)
                .map_err(|e| SnapkeepError::Config(format!("invalid filter pattern '{}': {}", p, e)))
        })
        .collect()
}

/// Runs two linked external commands, relaying stdout of the first into
/// stdin of the second. The second process's output is streamed into the
/// log line-by-line and returned; only its exit status gates success.
pub async fn run_pipeline(upstream: Vec<String>, downstream: Vec<String>) -> Result<Vec<String>> {
    debug!("Pipeline: '{} | {}'", upstream.join(" "), downstream.join(" "));

    let mut producer = Command::new(&upstream[0])
        .args(&upstream[1..])
        .stdout(Stdio::piped())
        .spawn()
        .map_err(|e| SnapkeepError::Host(format!("failed to spawn {}: {}", upstream[0], e)))?;

    let producer_stdout = producer
        .stdout
        .take()
        .ok_or_else(|| SnapkeepError::Host("producer stdout was not captured".to_string()))?;
    // Hands the write end over entirely; the parent keeps no copy of the
    // intermediate descriptor.
    let relay: Stdio = producer_stdout
        .try_into()
        .map_err(|e: std::io::Error| SnapkeepError::Host(format!("failed to relay pipe: {}", e)))?;

    let mut consumer = Command::new(&downstream[0])
        .args(&downstream[1..])
        .stdin(relay)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| SnapkeepError::Host(format!("failed to spawn {}: {}", downstream[0], e)))?;

    let stdout = consumer
        .stdout
        .take()
        .ok_or_else(|| SnapkeepError::Host("consumer stdout was not captured".to_string()))?;
    let stderr = consumer
        .stderr
        .take()
        .ok_or_else(|| SnapkeepError::Host("consumer stderr was not captured".to_string()))?;

    let stdout_task = tokio::spawn(async move {
        let mut lines = Vec::new();
        let mut reader = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            info!("{}", line);
            lines.push(line);
        }
        lines
    });
    let stderr_task = tokio::spawn(async move {
        let mut reader = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            info!("{}", line);
        }
    });

    let status = consumer
        .wait()
        .await
        .map_err(|e| SnapkeepError::Host(format!("failed to wait for {}: {}", downstream[0], e)))?;
    let lines = stdout_task.await.unwrap_or_default();
    let _ = stderr_task.await;

    // Reap the producer; only the consumer's exit code gates success.
    let _ = producer.wait().await;

    if !status.success() {
        return Err(SnapkeepError::Replication(format!(
            "'{}' exited with {}",
            downstream.join(" "),
            status
        )));
    }
    Ok(lines)
}

//! `kubectl`-backed implementation of the cluster boundary.

use std::path::PathBuf;
use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::log::Logger;
use crate::{plog_debug, plog_trace, Context, Error, Result};

use super::{PodExec, Resource, ResourceAccessor, ResourceKind};

#[derive(Debug, Clone)]
pub struct KubectlClient {
    binary: PathBuf,
    namespace: String,
    context: Option<String>,
    exec_timeout: Duration,
    log: Logger,
}

impl KubectlClient {
    /// Locate kubectl (configured path or PATH lookup) for the configured namespace.
    pub fn new(ctx: &Context) -> Result<Self> {
        let cluster = &ctx.config.cluster;
        let binary = match &cluster.kubectl {
            Some(path) => PathBuf::from(path),
            None => which::which("kubectl")
                .map_err(|_| Error::ToolNotAvailable("kubectl".to_string()))?,
        };
        Ok(Self {
            binary,
            namespace: cluster.namespace.clone(),
            context: cluster.context.clone(),
            exec_timeout: ctx.config.fleet.exec_timeout(),
            log: ctx.log.clone(),
        })
    }

    #[cfg(test)]
    fn with_exec_timeout(mut self, timeout: Duration) -> Self {
        self.exec_timeout = timeout;
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        if let Some(context) = &self.context {
            cmd.args(["--context", context.as_str()]);
        }
        cmd.args(["-n", self.namespace.as_str()]);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn run(&self, args: &[&str], stdin: Option<&[u8]>, what: &str) -> Result<Output> {
        plog_debug!(self.log, "kubectl {}", args.join(" "));
        let mut cmd = self.command();
        cmd.args(args);
        if stdin.is_some() {
            cmd.stdin(Stdio::piped());
        }
        let mut child = cmd.spawn().map_err(|e| Error::transport(what, e))?;
        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input)
                .await
                .map_err(|e| Error::transport(what, e))?;
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Error::transport(what, e))?;
        plog_trace!(
            self.log,
            "kubectl {} -> {} ({} bytes)",
            args.first().unwrap_or(&""),
            output.status,
            output.stdout.len()
        );
        Ok(output)
    }

    async fn run_json(&self, args: &[&str], stdin: Option<&[u8]>, what: &str) -> Result<Value> {
        let output = self.run(args, stdin, what).await?;
        if !output.status.success() {
            return Err(Error::transport(what, stderr_of(&output)));
        }
        serde_json::from_slice(&output.stdout).map_err(|e| Error::transport(what, e))
    }

    async fn write(&self, verb: &str, definition: &Resource) -> Result<Resource> {
        let what = format!("{} {}", verb, definition.reference());
        let body = serde_json::to_vec(definition.body())?;
        let value = self
            .run_json(&[verb, "-f", "-", "-o", "json"], Some(&body), &what)
            .await?;
        Ok(Resource::new(definition.kind(), value))
    }
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

fn is_not_found(output: &Output) -> bool {
    let stderr = String::from_utf8_lossy(&output.stderr);
    stderr.contains("NotFound") || stderr.contains("not found")
}

#[async_trait]
impl ResourceAccessor for KubectlClient {
    async fn get(&self, kind: ResourceKind, name: &str) -> Result<Option<Resource>> {
        let what = format!("get {}/{}", kind.cli_name(), name);
        let output = self
            .run(&["get", kind.cli_name(), name, "-o", "json"], None, &what)
            .await?;
        if !output.status.success() {
            if is_not_found(&output) {
                return Ok(None);
            }
            return Err(Error::transport(what, stderr_of(&output)));
        }
        let value = serde_json::from_slice(&output.stdout).map_err(|e| Error::transport(&what, e))?;
        Ok(Some(Resource::new(kind, value)))
    }

    async fn list(&self, kind: ResourceKind, selector: &str) -> Result<Vec<Resource>> {
        let what = format!("list {} -l {}", kind.cli_name(), selector);
        let value = self
            .run_json(&["get", kind.cli_name(), "-l", selector, "-o", "json"], None, &what)
            .await?;
        Ok(value
            .get("items")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .map(|item| Resource::new(kind, item.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn create(&self, definition: &Resource) -> Result<Resource> {
        self.write("create", definition).await
    }

    async fn replace(&self, definition: &Resource) -> Result<Resource> {
        self.write("replace", definition).await
    }

    async fn delete(&self, kind: ResourceKind, name: &str) -> Result<()> {
        let what = format!("delete {}/{}", kind.cli_name(), name);
        let output = self
            .run(&["delete", kind.cli_name(), name, "--ignore-not-found"], None, &what)
            .await?;
        if !output.status.success() {
            return Err(Error::transport(what, stderr_of(&output)));
        }
        Ok(())
    }

    async fn status(&self, kind: ResourceKind, name: &str) -> Result<Value> {
        let what = format!("status {}/{}", kind.cli_name(), name);
        let value = self
            .run_json(
                &["get", kind.cli_name(), name, "--subresource=status", "-o", "json"],
                None,
                &what,
            )
            .await?;
        Ok(value.get("status").cloned().unwrap_or(Value::Null))
    }
}

#[async_trait]
impl PodExec for KubectlClient {
    async fn exec(
        &self,
        pod: &str,
        argv: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let what = format!("exec in pod/{}", pod);
        plog_debug!(self.log, "{}: {}", what, argv.join(" "));
        let mut cmd = self.command();
        cmd.args(["exec", pod, "--"]).args(argv);
        let child = cmd.spawn().map_err(|e| Error::transport(&what, e))?;

        // Losing the race drops `child`, and kill_on_drop takes kubectl (and
        // with it the exec stream) down.
        tokio::select! {
            output = child.wait_with_output() => {
                let output = output.map_err(|e| Error::transport(&what, e))?;
                if !output.status.success() {
                    return Err(Error::transport(what, stderr_of(&output)));
                }
                Ok(output.stdout)
            }
            _ = tokio::time::sleep(self.exec_timeout) => Err(Error::Timeout {
                what,
                elapsed: self.exec_timeout,
            }),
            _ = cancel.cancelled() => Err(Error::transport(what, "cancelled")),
        }
    }
}

//! Component E (invocation half): hands a formatted transaction file to
//! the external Portfolio Accounting CLI.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{error, warn};

use crate::errors::{PipelineError, PipelineResult};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

const CONTAINER_RUN_VERBS: &[&str] = &["docker run", "podman run", "kubectl run", "docker-compose run"];

#[async_trait]
pub trait CliInvoker: Send + Sync {
    async fn invoke(&self, file_name: &str, output_dir: &str) -> PipelineResult<()>;
}

pub struct ProcessCliInvoker {
    command_template: String,
    timeout: Duration,
}

impl ProcessCliInvoker {
    pub fn new(command_template: String) -> Self {
        Self {
            command_template,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    fn render(&self, file_name: &str, output_dir: &str) -> String {
        let home = std::env::var("HOME").unwrap_or_default();
        self.command_template
            .replace("{filename}", file_name)
            .replace("{output_dir}", output_dir)
            .replace("{home}", &home)
    }
}

#[async_trait]
impl CliInvoker for ProcessCliInvoker {
    async fn invoke(&self, file_name: &str, output_dir: &str) -> PipelineResult<()> {
        let rendered = self.render(file_name, output_dir);
        let is_container_run = CONTAINER_RUN_VERBS
            .iter()
            .any(|verb| rendered.trim_start().starts_with(verb));

        let mut command = if is_container_run {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(&rendered);
            cmd
        } else {
            let args = split_respecting_quotes(&rendered);
            let mut iter = args.into_iter();
            let program = iter
                .next()
                .ok_or_else(|| PipelineError::CliFailure("empty command template".to_string()))?;
            let mut cmd = Command::new(program);
            cmd.args(iter);
            cmd
        };

        command.stdin(Stdio::null());

        let output = timeout(self.timeout, command.output()).await;

        match output {
            Ok(Ok(out)) if out.status.success() => Ok(()),
            Ok(Ok(out)) => {
                let combined = format!(
                    "{}{}",
                    String::from_utf8_lossy(&out.stdout),
                    String::from_utf8_lossy(&out.stderr)
                );
                error!(status = ?out.status, "cli invocation exited non-zero");
                Err(PipelineError::CliFailure(format!(
                    "exit {:?}: {}",
                    out.status.code(),
                    combined.trim()
                )))
            }
            Ok(Err(e)) => {
                error!(error = %e, "failed to spawn cli");
                Err(PipelineError::CliFailure(e.to_string()))
            }
            Err(_) => {
                warn!("cli invocation timed out");
                Err(PipelineError::CliFailure("invocation timed out".to_string()))
            }
        }
    }
}

/// Splits a command string into argv, respecting double-quoted substrings
/// (quotes are stripped from the resulting tokens).
fn split_respecting_quotes(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' => in_quotes = !in_quotes,
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

pub struct StubCliInvoker {
    pub fail_with: parking_lot::Mutex<Option<String>>,
    pub calls: parking_lot::Mutex<Vec<(String, String)>>,
}

impl StubCliInvoker {
    pub fn new() -> Self {
        Self {
            fail_with: parking_lot::Mutex::new(None),
            calls: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn failing(reason: &str) -> Self {
        Self {
            fail_with: parking_lot::Mutex::new(Some(reason.to_string())),
            calls: parking_lot::Mutex::new(Vec::new()),
        }
    }
}

impl Default for StubCliInvoker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CliInvoker for StubCliInvoker {
    async fn invoke(&self, file_name: &str, output_dir: &str) -> PipelineResult<()> {
        self.calls
            .lock()
            .push((file_name.to_string(), output_dir.to_string()));
        if let Some(reason) = self.fail_with.lock().clone() {
            return Err(PipelineError::CliFailure(reason));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_whitespace() {
        let tokens = split_respecting_quotes("portfolio-accounting-cli --file a.csv --dir /out");
        assert_eq!(tokens, vec!["portfolio-accounting-cli", "--file", "a.csv", "--dir", "/out"]);
    }

    #[test]
    fn respects_quoted_substrings() {
        let tokens = split_respecting_quotes(r#"cli --name "hello world" --flag"#);
        assert_eq!(tokens, vec!["cli", "--name", "hello world", "--flag"]);
    }

    #[test]
    fn placeholders_are_substituted() {
        let invoker = ProcessCliInvoker::new("cli --file {filename} --dir {output_dir}".into());
        let rendered = invoker.render("transactions_123.csv", "/data/out");
        assert_eq!(rendered, "cli --file transactions_123.csv --dir /data/out");
    }

    #[test]
    fn container_run_verb_is_detected() {
        let invoker = ProcessCliInvoker::new("docker run --rm acct-cli {filename}".into());
        let rendered = invoker.render("x.csv", "/out");
        assert!(CONTAINER_RUN_VERBS
            .iter()
            .any(|verb| rendered.trim_start().starts_with(verb)));
    }
}

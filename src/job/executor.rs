//! Builds and launches the assistant CLI invocation for a job.
//!
//! Mode A pipes the prompt to a synchronous child and captures its output —
//! useful for tests, not for production, since the child dies with the
//! parent. Mode B writes a self-contained launcher script that records its
//! own PID and appends a completion sentinel to an output file, then detaches
//! the script so the assistant CLI survives this process restarting.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::{Config, ExecutionMode};
use crate::process::ProcessRunner;

use super::Job;

static SENTINEL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^Exit code: (-?\d+)\s*$").unwrap());
static PLACEHOLDER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{\{([^{}]+)\}\}").unwrap());

#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    /// The script was detached and is running under `pid`.
    Launched(u32),
    /// The child already finished — either Mode A ran to completion, or
    /// Mode B's script died within the post-spawn grace window.
    Completed { exit_code: i32, output: String },
}

#[derive(Debug, Clone)]
pub enum CompletionProbe {
    StillRunning,
    Completed { exit_code: i32, output: String },
    DiedWithoutSentinel { output: String },
}

pub struct PromptExecutor {
    config: Arc<Config>,
}

impl PromptExecutor {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    pub async fn execute(&self, job: &Job, indexer_ready: Option<bool>) -> Result<ExecutionOutcome> {
        match self.config.execution_mode {
            ExecutionMode::Direct => self.run_direct(job, indexer_ready).await,
            ExecutionMode::FireAndForget => self.launch_detached(job, indexer_ready).await,
        }
    }

    /// Probes the indexer's `status` subcommand inside `workspace` and
    /// matches its output against the configured readiness pattern.
    pub async fn probe_indexer_ready(&self, workspace: &Path) -> bool {
        let result = ProcessRunner::run(
            &self.config.indexer_cmd,
            &["status"],
            Some(workspace),
            &[],
            None,
            Duration::from_secs(30),
        )
        .await;

        match result {
            Ok(output) => self.config.indexer_ready_pattern.matches(&output.stdout),
            Err(_) => false,
        }
    }

    /// Read the job's output file and classify its completion state.
    pub fn check_completion(&self, job: &Job) -> CompletionProbe {
        let raw = std::fs::read_to_string(job.output_path()).unwrap_or_default();

        if let Some((exit_code, stripped)) = extract_sentinel(&raw) {
            return CompletionProbe::Completed {
                exit_code,
                output: stripped,
            };
        }

        if let Some(pid) = job.pid {
            if !ProcessRunner::is_alive(pid) {
                return CompletionProbe::DiedWithoutSentinel { output: raw };
            }
        }

        CompletionProbe::StillRunning
    }

    async fn run_direct(&self, job: &Job, indexer_ready: Option<bool>) -> Result<ExecutionOutcome> {
        let template = self.system_prompt_for(job, indexer_ready);
        let timeout = Duration::from_secs(
            job.options
                .timeout_seconds
                .unwrap_or(self.config.default_job_timeout_seconds),
        );
        let env = self.build_environment(job);

        let mut args: Vec<&str> = self.config.assistant_args_prefix.iter().map(String::as_str).collect();
        args.push("--append-system-prompt");
        args.push(&template);

        let output = ProcessRunner::run(
            &self.config.assistant_cmd,
            &args,
            Some(&job.workspace_path),
            &env,
            Some(&job.prompt),
            timeout,
        )
        .await
        .context("direct execution of the assistant CLI failed")?;

        Ok(ExecutionOutcome::Completed {
            exit_code: output.exit_code,
            output: format!("{}{}", output.stdout, output.stderr),
        })
    }

    async fn launch_detached(&self, job: &Job, indexer_ready: Option<bool>) -> Result<ExecutionOutcome> {
        let script = self.build_launcher_script(job, indexer_ready);
        let script_path = job.script_path();

        std::fs::write(&script_path, script)
            .with_context(|| format!("failed to write launcher script {}", script_path.display()))?;
        set_executable(&script_path)?;

        let pid = ProcessRunner::spawn_detached(
            "/bin/bash",
            &[script_path.to_string_lossy().as_ref()],
            Some(&job.workspace_path),
            &[],
        )
        .context("failed to spawn launcher script")?;

        tokio::time::sleep(Duration::from_millis(100)).await;

        if !ProcessRunner::is_alive(pid) {
            let raw = std::fs::read_to_string(job.output_path()).unwrap_or_default();
            if let Some((exit_code, stripped)) = extract_sentinel(&raw) {
                return Ok(ExecutionOutcome::Completed {
                    exit_code,
                    output: stripped,
                });
            }
            anyhow::bail!("launcher script for job {} exited before producing a completion sentinel", job.id);
        }

        Ok(ExecutionOutcome::Launched(pid))
    }

    fn build_launcher_script(&self, job: &Job, indexer_ready: Option<bool>) -> String {
        let template = self.system_prompt_for(job, indexer_ready);
        let env = self.build_environment(job);
        let prompt = substitute_placeholders(&job.prompt, &job.uploaded_filenames);

        let mut script = String::new();
        script.push_str("#!/bin/bash\n");
        script.push_str("set -uo pipefail\n");
        for (key, value) in &env {
            script.push_str(&format!("export {key}=\"{}\"\n", escape_for_double_quotes(value)));
        }
        script.push_str(&format!("cd \"{}\"\n", job.workspace_path.display()));
        script.push_str(&format!("echo $$ > \"{}\"\n", job.pid_path().display()));

        let mut prefix_args = String::new();
        for extra in &self.config.assistant_args_prefix {
            prefix_args.push_str(&format!("\"{}\" ", escape_for_double_quotes(extra)));
        }

        script.push_str(&format!(
            "echo \"{}\" | {} {}--append-system-prompt \"{}\" >> \"{}\" 2>&1\n",
            escape_for_double_quotes(&prompt),
            self.config.assistant_cmd,
            prefix_args,
            escape_for_double_quotes(&template),
            job.output_path().display(),
        ));
        script.push_str(&format!("echo \"Exit code: $?\" >> \"{}\"\n", job.output_path().display()));
        script
    }

    fn system_prompt_for(&self, job: &Job, indexer_ready: Option<bool>) -> String {
        let templates = &self.config.system_prompt_templates;
        if !job.options.indexer_aware {
            return templates.disabled.clone();
        }
        match indexer_ready {
            Some(true) => templates.available.clone(),
            _ => templates.unavailable.clone(),
        }
    }

    fn build_environment(&self, job: &Job) -> Vec<(String, String)> {
        let mut env = Vec::new();

        for name in &self.config.environment_passthrough {
            if let Ok(value) = std::env::var(name) {
                env.push((name.clone(), value));
            }
        }

        env.push(("CLAUDE_BATCH_JOB_ID".to_string(), job.id.to_string()));
        env.push(("CLAUDE_BATCH_REPOSITORY".to_string(), job.repository.clone()));

        for (key, value) in &self.config.extra_env {
            env.push((key.clone(), value.clone()));
        }
        for (key, value) in &job.options.environment_overrides {
            env.push((key.clone(), value.clone()));
        }

        env
    }
}

/// `{{name}}` is replaced with `./files/name` when `name` is one of the
/// job's uploads; any other `{{...}}` placeholder is replaced with a
/// space-joined list of every uploaded file's workspace-relative path.
fn substitute_placeholders(prompt: &str, uploaded_filenames: &[String]) -> String {
    let all_paths = uploaded_filenames
        .iter()
        .map(|f| format!("./files/{f}"))
        .collect::<Vec<_>>()
        .join(" ");

    PLACEHOLDER_RE
        .replace_all(prompt, |caps: &regex::Captures| {
            let name = &caps[1];
            if uploaded_filenames.iter().any(|f| f == name) {
                format!("./files/{name}")
            } else {
                all_paths.clone()
            }
        })
        .into_owned()
}

/// Escapes a string for safe embedding inside a double-quoted shell string:
/// backslash, double quote, `$`, and backtick all need an escaping
/// backslash or bash will still interpret them despite the quoting.
fn escape_for_double_quotes(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '\\' | '"' | '$' | '`') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Finds the last `Exit code: N` sentinel line and returns the parsed code
/// plus the output with that line (and everything after it) stripped.
pub(crate) fn extract_sentinel(raw: &str) -> Option<(i32, String)> {
    let capture = SENTINEL_RE.captures_iter(raw).last()?;
    let exit_code: i32 = capture[1].parse().ok()?;
    let whole_match = capture.get(0)?;
    let stripped = raw[..whole_match.start()].to_string();
    Some((exit_code, stripped))
}

#[cfg(unix)]
fn set_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> Result<()> {
    Ok(())
}

//! Local child-process executor
//!
//! Runs `<program> <script> --key value ...` for each job. A JSON document on
//! stdout becomes the result; otherwise stdout is wrapped as `{"stdout": ..}`.
//! Lines on stderr of the form `PROGRESS <fraction>` are reported as progress.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::{json, Value};
use simflow_core::NodeError;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;

use super::{JobContext, TaskExecutor};
use crate::error::ExecutorError;

/// Number of stderr lines kept for error details
const STDERR_TAIL_LINES: usize = 20;

/// Runs jobs as local child processes
#[derive(Debug, Clone, Default)]
pub struct LocalProcessExecutor {
    programs: HashMap<String, PathBuf>,
    working_dir: Option<PathBuf>,
    env: Vec<(String, String)>,
}

impl LocalProcessExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the program that implements `tool`
    pub fn with_tool(mut self, tool: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        self.programs.insert(tool.into(), program.into());
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    fn command(&self, ctx: &JobContext) -> Result<Command, ExecutorError> {
        let program = self
            .programs
            .get(&ctx.tool)
            .ok_or_else(|| ExecutorError::UnknownTool(ctx.tool.clone()))?;

        let mut cmd = Command::new(program);
        if !ctx.script.is_empty() {
            cmd.arg(&ctx.script);
        }
        for (key, value) in &ctx.params {
            cmd.arg(format!("--{key}")).arg(param_arg(value));
        }
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd.envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env("SIMFLOW_TASK_ID", ctx.task_id.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(cmd)
    }

    async fn run(&self, ctx: &JobContext) -> Result<Value, NodeError> {
        let mut cmd = self.command(ctx)?;
        let program = self
            .programs
            .get(&ctx.tool)
            .map(|p| p.display().to_string())
            .unwrap_or_default();

        let mut child = cmd
            .spawn()
            .map_err(|source| ExecutorError::Spawn { program, source })?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let read_stdout = async {
            let mut out = String::new();
            if let Some(mut stdout) = stdout {
                stdout.read_to_string(&mut out).await?;
            }
            Ok::<_, std::io::Error>(out)
        };

        let read_stderr = async {
            let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Some(line) = lines.next_line().await? {
                    if let Some(progress) = parse_progress(&line) {
                        ctx.report_progress(progress);
                        continue;
                    }
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            }
            Ok::<_, std::io::Error>(tail)
        };

        let (status, stdout, stderr) = tokio::join!(child.wait(), read_stdout, read_stderr);
        let status = status.map_err(ExecutorError::Io)?;
        let stdout = stdout.map_err(ExecutorError::Io)?;
        let stderr: Vec<String> = stderr.map_err(ExecutorError::Io)?.into();

        if status.success() {
            return Ok(parse_stdout(&stdout));
        }

        let summary = stderr
            .last()
            .cloned()
            .unwrap_or_else(|| format!("process exited with {status}"));
        Err(NodeError::from_message(summary).with_details(json!({
            "exit_code": status.code(),
            "stderr": stderr,
        })))
    }
}

#[async_trait]
impl TaskExecutor for LocalProcessExecutor {
    fn capabilities(&self) -> Vec<String> {
        let mut tools: Vec<String> = self.programs.keys().cloned().collect();
        tools.sort();
        tools
    }

    #[tracing::instrument(skip(self, ctx), fields(task_id = %ctx.task_id, tool = %ctx.tool))]
    async fn execute(&self, ctx: JobContext) -> Result<Value, NodeError> {
        tracing::debug!(script = %ctx.script, "starting local process");
        let result = self.run(&ctx).await;
        if let Err(e) = &result {
            tracing::debug!(error = %e, "local process failed");
        }
        result
    }
}

fn param_arg(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn parse_progress(line: &str) -> Option<f64> {
    line.strip_prefix("PROGRESS ")?.trim().parse().ok()
}

fn parse_stdout(stdout: &str) -> Value {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return json!({});
    }
    serde_json::from_str(trimmed).unwrap_or_else(|_| json!({ "stdout": trimmed }))
}

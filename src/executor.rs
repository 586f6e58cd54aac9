//! Task executor contract and the built-in executors.
//!
//! The executor is an opaque collaborator: it receives a task id and its input
//! reference and produces output as a side effect. Its result never travels
//! back to the coordinator.

use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::thread;
use std::time::Duration;

use crate::error::ExecutorError;
use crate::types::{TaskId, TaskRef, WorkerId};

/// Per-worker state handed to every execution instead of process-wide globals.
#[derive(Clone, Debug)]
pub struct ExecutionContext {
    pub worker: WorkerId,
    /// Where executors that produce files put them.
    pub output_dir: Option<PathBuf>,
}

impl ExecutionContext {
    pub fn new(worker: WorkerId) -> Self {
        Self {
            worker,
            output_dir: None,
        }
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }
}

pub trait TaskExecutor: Send + Sync {
    fn execute(
        &self,
        ctx: &ExecutionContext,
        task: TaskId,
        input: &TaskRef,
    ) -> Result<(), ExecutorError>;
}

/// Stand-in workload: sleeps for a fixed time and, given an output directory,
/// leaves a `<task>.done` marker naming the worker that ran it.
#[derive(Clone, Debug)]
pub struct SimulatedExecutor {
    work: Duration,
}

impl SimulatedExecutor {
    pub fn new(work: Duration) -> Self {
        Self { work }
    }
}

impl TaskExecutor for SimulatedExecutor {
    fn execute(
        &self,
        ctx: &ExecutionContext,
        task: TaskId,
        input: &TaskRef,
    ) -> Result<(), ExecutorError> {
        if !self.work.is_zero() {
            thread::sleep(self.work);
        }
        if let Some(dir) = ctx.output_dir.as_ref() {
            // Re-executions overwrite the marker; the last writer wins.
            fs::write(
                dir.join(format!("{task:06}.done")),
                format!("worker={} input={input}\n", ctx.worker),
            )?;
        }
        Ok(())
    }
}

/// Runs an external program once per task as `<program> [args..] <task> <input>`.
///
/// The worker id and output directory are exported as `FLEET_WORKER` and
/// `FLEET_OUTPUT_DIR`.
#[derive(Clone, Debug)]
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
}

impl CommandExecutor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl TaskExecutor for CommandExecutor {
    fn execute(
        &self,
        ctx: &ExecutionContext,
        task: TaskId,
        input: &TaskRef,
    ) -> Result<(), ExecutorError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(task.to_string())
            .arg(input.as_str())
            .env("FLEET_WORKER", ctx.worker.to_string());
        if let Some(dir) = ctx.output_dir.as_ref() {
            command.env("FLEET_OUTPUT_DIR", dir);
        }
        let status = command.status().map_err(|source| ExecutorError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        if status.success() {
            Ok(())
        } else {
            Err(ExecutorError::CommandFailed {
                program: self.program.clone(),
                status: status.to_string(),
            })
        }
    }
}

/// Adapts a closure into an executor.
pub struct FnExecutor<F>(pub F);

impl<F> TaskExecutor for FnExecutor<F>
where
    F: Fn(&ExecutionContext, TaskId, &TaskRef) -> Result<(), ExecutorError> + Send + Sync,
{
    fn execute(
        &self,
        ctx: &ExecutionContext,
        task: TaskId,
        input: &TaskRef,
    ) -> Result<(), ExecutorError> {
        (self.0)(ctx, task, input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_executor_writes_marker() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = ExecutionContext::new(3).with_output_dir(dir.path());
        SimulatedExecutor::new(Duration::ZERO)
            .execute(&ctx, 12, &TaskRef::new("img/000012.bmp"))
            .expect("execute");
        let marker = fs::read_to_string(dir.path().join("000012.done")).expect("marker");
        assert_eq!(marker, "worker=3 input=img/000012.bmp\n");
    }

    #[test]
    fn simulated_executor_reports_unwritable_output() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("missing");
        let ctx = ExecutionContext::new(0).with_output_dir(missing);
        let result = SimulatedExecutor::new(Duration::ZERO).execute(&ctx, 0, &TaskRef::new("x"));
        assert!(matches!(result, Err(ExecutorError::Io(_))));
    }

    #[cfg(unix)]
    #[test]
    fn command_executor_maps_exit_status() {
        let ctx = ExecutionContext::new(0);
        let input = TaskRef::new("in");
        assert!(CommandExecutor::new("true", Vec::new())
            .execute(&ctx, 0, &input)
            .is_ok());
        let failed = CommandExecutor::new("false", Vec::new()).execute(&ctx, 0, &input);
        assert!(matches!(failed, Err(ExecutorError::CommandFailed { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn command_executor_passes_task_and_input() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = ExecutionContext::new(4).with_output_dir(dir.path());
        let script = r#"echo "$FLEET_WORKER $1 $2" > "$FLEET_OUTPUT_DIR/out.txt""#;
        CommandExecutor::new("sh", vec!["-c".to_string(), script.to_string(), "sh".to_string()])
            .execute(&ctx, 9, &TaskRef::new("a.bmp"))
            .expect("execute");
        let written = fs::read_to_string(dir.path().join("out.txt")).expect("output");
        assert_eq!(written.trim(), "4 9 a.bmp");
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let ctx = ExecutionContext::new(0);
        let result = CommandExecutor::new("/nonexistent/fleet-executor", Vec::new())
            .execute(&ctx, 0, &TaskRef::new("x"));
        assert!(matches!(result, Err(ExecutorError::Spawn { .. })));
    }
}

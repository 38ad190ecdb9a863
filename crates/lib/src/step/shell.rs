//! Shell steps in an isolated environment.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, info};

use crate::cache::join_slash_path;
use crate::util::BoxFuture;

use super::types::{Step, StepContext, StepExecutor, StepResult};

/// Scratch directory inside each output dir. Never part of an artifact.
pub const TMP_DIR_NAME: &str = "tmp";

/// Value of `SOURCE_DATE_EPOCH`: 1980-01-01T00:00:00Z, the ZIP epoch.
const SOURCE_DATE_EPOCH: &str = "315532800";

/// Runs steps through the platform shell.
///
/// Commands start from an empty environment with:
/// - `PATH=/path-not-set`, so undeclared host tools fail fast
/// - `HOME=/homeless-shelter`
/// - `TMPDIR`, `TMP`, `TEMP`, `TEMPDIR` pointing into the output dir
/// - `out`, `root` and `outputs` for the output dir, project root and output root
/// - `tool_<name>` for every tool the rule declares
/// - `LANG=C`, `LC_ALL=C` and a fixed `SOURCE_DATE_EPOCH`
///
/// A step's own `env` is applied last and may override any of these.
#[derive(Debug, Clone, Default)]
pub struct ShellStepExecutor {
  shell: Option<String>,
}

impl ShellStepExecutor {
  pub fn new() -> Self {
    Self::default()
  }

  /// Use `shell` instead of the platform default.
  pub fn with_shell(shell: impl Into<String>) -> Self {
    Self {
      shell: Some(shell.into()),
    }
  }

  async fn run_cmd(&self, ctx: &StepContext, cmd: &str, env: &BTreeMap<String, String>, cwd: Option<&str>) -> StepResult {
    info!(target = %ctx.target, cmd = %cmd, "executing command");

    let tmp_dir = ctx.output_dir.join(TMP_DIR_NAME);
    if let Err(e) = tokio::fs::create_dir_all(&tmp_dir).await {
      return StepResult::failure(format!("failed to create {}: {e}", tmp_dir.display()));
    }

    let working_dir: PathBuf = match cwd {
      Some(dir) if Path::new(dir).is_absolute() => PathBuf::from(dir),
      Some(dir) => ctx.project_root.join(dir),
      None => ctx.output_dir.clone(),
    };

    let (shell_cmd, shell_args) = get_shell(self.shell.as_deref());
    let mut command = Command::new(&shell_cmd);
    command
      .args(&shell_args)
      .arg(cmd)
      .current_dir(&working_dir)
      .stdin(Stdio::null())
      .env_clear()
      .env("PATH", "/path-not-set")
      .env("HOME", "/homeless-shelter")
      .env("TMPDIR", &tmp_dir)
      .env("TMP", &tmp_dir)
      .env("TEMP", &tmp_dir)
      .env("TEMPDIR", &tmp_dir)
      .env("out", &ctx.output_dir)
      .env("root", &ctx.project_root)
      .env("outputs", &ctx.output_root)
      .env("LANG", "C")
      .env("LC_ALL", "C")
      .env("SOURCE_DATE_EPOCH", SOURCE_DATE_EPOCH);

    for (name, prefix) in &ctx.tools {
      command.env(format!("tool_{name}"), prefix);
    }
    for (key, value) in env {
      command.env(key, value);
    }

    debug!(shell = %shell_cmd, working_dir = ?working_dir, "spawning process");

    let output = match command.output().await {
      Ok(output) => output,
      Err(e) => return StepResult::failure(format!("failed to spawn {shell_cmd}: {e}")),
    };

    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);

    if !output.status.success() {
      if !stderr.is_empty() {
        debug!(stderr = %stderr, "command stderr");
      }
      if !stdout.is_empty() {
        debug!(stdout = %stdout, "command stdout");
      }

      let code = output.status.code();
      let detail = stderr.trim().lines().last().unwrap_or_default();
      let message = match (code, detail.is_empty()) {
        (Some(code), true) => format!("command exited with code {code}"),
        (Some(code), false) => format!("command exited with code {code}: {detail}"),
        (None, _) => "command terminated by signal".to_string(),
      };
      return StepResult::Failure {
        exit_code: code,
        message,
      };
    }

    let stdout = stdout.trim();
    if !stdout.is_empty() {
      debug!(stdout = %stdout, "command output");
    }
    StepResult::Success
  }

  async fn write_file(&self, ctx: &StepContext, path: &str, content: &str) -> StepResult {
    let dest = match join_slash_path(&ctx.output_dir, path) {
      Ok(dest) => dest,
      Err(e) => return StepResult::failure(e.to_string()),
    };
    if let Some(parent) = dest.parent()
      && let Err(e) = tokio::fs::create_dir_all(parent).await
    {
      return StepResult::failure(format!("failed to create {}: {e}", parent.display()));
    }
    match tokio::fs::write(&dest, content).await {
      Ok(()) => {
        debug!(target = %ctx.target, path = %dest.display(), "wrote file");
        StepResult::Success
      }
      Err(e) => StepResult::failure(format!("failed to write {}: {e}", dest.display())),
    }
  }
}

impl StepExecutor for ShellStepExecutor {
  fn execute<'a>(&'a self, ctx: &'a StepContext, step: &'a Step) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
      match step {
        Step::Cmd { cmd, env, cwd } => self.run_cmd(ctx, cmd, env, cwd.as_deref()).await,
        Step::WriteFile { path, content } => self.write_file(ctx, path, content).await,
      }
    })
  }
}

/// Shell and the arguments that precede the command string.
///
/// Profiles of interactive shells can rewrite the environment, so `$SHELL`
/// is never consulted.
fn get_shell(override_shell: Option<&str>) -> (String, Vec<String>) {
  if let Some(shell) = override_shell {
    let args = if shell.contains("powershell") || shell.contains("pwsh") {
      vec!["-NoProfile".to_string(), "-Command".to_string()]
    } else if shell.contains("cmd") {
      vec!["/C".to_string()]
    } else {
      vec!["-c".to_string()]
    };
    return (shell.to_string(), args);
  }

  #[cfg(unix)]
  {
    ("/bin/sh".to_string(), vec!["-c".to_string()])
  }

  #[cfg(windows)]
  {
    (
      "powershell.exe".to_string(),
      vec![
        "-NoProfile".to_string(),
        "-ExecutionPolicy".to_string(),
        "Bypass".to_string(),
        "-Command".to_string(),
      ],
    )
  }
}

#[cfg(all(test, unix))]
mod tests {
  use super::*;
  use crate::target::BuildTarget;
  use crate::util::CancellationFlag;
  use serial_test::serial;
  use tempfile::TempDir;

  fn context(temp: &TempDir) -> StepContext {
    let output_root = temp.path().join("out");
    let output_dir = output_root.join("pkg").join("gen");
    std::fs::create_dir_all(&output_dir).unwrap();
    StepContext {
      target: BuildTarget::parse("//pkg:gen").unwrap(),
      output_dir,
      output_root,
      project_root: temp.path().to_path_buf(),
      tools: BTreeMap::from([("cc".to_string(), PathBuf::from("/opt/cc/bin/cc"))]),
      cancellation: CancellationFlag::new(),
    }
  }

  fn cmd(cmd: &str) -> Step {
    Step::Cmd {
      cmd: cmd.to_string(),
      env: BTreeMap::new(),
      cwd: None,
    }
  }

  async fn run_and_read(ctx: &StepContext, command: &str) -> String {
    let step = cmd(&format!("{command} > \"$out/result\""));
    assert_eq!(ShellStepExecutor::new().execute(ctx, &step).await, StepResult::Success);
    std::fs::read_to_string(ctx.output_dir.join("result")).unwrap().trim().to_string()
  }

  #[tokio::test]
  async fn environment_is_isolated() {
    let temp = TempDir::new().unwrap();
    let ctx = context(&temp);

    assert_eq!(run_and_read(&ctx, "echo $PATH").await, "/path-not-set");
    assert_eq!(run_and_read(&ctx, "echo $HOME").await, "/homeless-shelter");
    assert_eq!(run_and_read(&ctx, "echo $SOURCE_DATE_EPOCH").await, "315532800");
    assert_eq!(run_and_read(&ctx, "echo $root").await, temp.path().to_string_lossy());
    assert_eq!(run_and_read(&ctx, "echo $tool_cc").await, "/opt/cc/bin/cc");
    assert!(ctx.output_dir.join(TMP_DIR_NAME).is_dir());
  }

  #[test]
  #[serial]
  fn parent_environment_does_not_leak() {
    let temp = TempDir::new().unwrap();
    let ctx = context(&temp);

    temp_env::with_var("QUARRY_HOST_ONLY", Some("visible"), || {
      let rt = tokio::runtime::Runtime::new().unwrap();
      let value = rt.block_on(run_and_read(&ctx, "echo \"host=$QUARRY_HOST_ONLY\""));
      assert_eq!(value, "host=");
    });
  }

  #[tokio::test]
  async fn step_env_overrides_defaults() {
    let temp = TempDir::new().unwrap();
    let ctx = context(&temp);
    let step = Step::Cmd {
      cmd: "echo $PATH > \"$out/result\"".to_string(),
      env: BTreeMap::from([("PATH".to_string(), "/usr/bin:/bin".to_string())]),
      cwd: None,
    };

    assert!(ShellStepExecutor::new().execute(&ctx, &step).await.is_success());
    assert_eq!(
      std::fs::read_to_string(ctx.output_dir.join("result")).unwrap().trim(),
      "/usr/bin:/bin"
    );
  }

  #[tokio::test]
  async fn relative_cwd_is_under_project_root() {
    let temp = TempDir::new().unwrap();
    let ctx = context(&temp);
    std::fs::create_dir_all(temp.path().join("src")).unwrap();
    let step = Step::Cmd {
      cmd: "echo here > marker".to_string(),
      env: BTreeMap::new(),
      cwd: Some("src".to_string()),
    };

    assert!(ShellStepExecutor::new().execute(&ctx, &step).await.is_success());
    assert!(temp.path().join("src/marker").exists());
  }

  #[tokio::test]
  async fn failure_reports_exit_code_and_stderr() {
    let temp = TempDir::new().unwrap();
    let ctx = context(&temp);

    let result = ShellStepExecutor::new()
      .execute(&ctx, &cmd("echo broken >&2; exit 3"))
      .await;
    assert_eq!(
      result,
      StepResult::Failure {
        exit_code: Some(3),
        message: "command exited with code 3: broken".to_string()
      }
    );
  }

  #[tokio::test]
  async fn write_file_stays_inside_output_dir() {
    let temp = TempDir::new().unwrap();
    let ctx = context(&temp);
    let executor = ShellStepExecutor::new();

    let ok = Step::WriteFile {
      path: "nested/out.txt".to_string(),
      content: "hello".to_string(),
    };
    assert!(executor.execute(&ctx, &ok).await.is_success());
    assert_eq!(std::fs::read_to_string(ctx.output_dir.join("nested/out.txt")).unwrap(), "hello");

    let escape = Step::WriteFile {
      path: "../escape.txt".to_string(),
      content: "nope".to_string(),
    };
    assert!(!executor.execute(&ctx, &escape).await.is_success());
  }

  #[test]
  fn get_shell_overrides() {
    assert_eq!(get_shell(Some("/usr/bin/bash")).1, vec!["-c"]);
    assert_eq!(get_shell(Some("cmd.exe")).1, vec!["/C"]);
    assert_eq!(get_shell(Some("pwsh")).1, vec!["-NoProfile", "-Command"]);
    assert_eq!(get_shell(None).0, "/bin/sh");
  }
}

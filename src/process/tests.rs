//! Unit tests for process invocation.

use std::sync::Arc;

use rstest::rstest;

use super::*;

#[rstest]
fn command_line_escapes_arguments() {
    let spec = CommandSpec::new("gcloud").args(["compute", "networks", "a b"]);
    assert_eq!(spec.command_line(), "gcloud compute networks 'a b'");
}

#[rstest]
#[case(Some(0), true)]
#[case(Some(1), false)]
#[case(None, false)]
fn is_success_requires_zero_exit(#[case] code: Option<i32>, #[case] expected: bool) {
    let output = CommandOutput {
        code,
        ..CommandOutput::default()
    };
    assert_eq!(output.is_success(), expected);
}

#[rstest]
fn check_carries_stderr_on_failure() {
    let output = CommandOutput {
        code: Some(2),
        stdout: String::new(),
        stderr: String::from("quota exceeded\n"),
    };
    let err = output.check("gcloud").expect_err("non-zero exit should fail");
    assert_eq!(
        err,
        ProcessError::CommandFailure {
            program: String::from("gcloud"),
            status: Some(2),
            status_text: String::from("2"),
            stderr: String::from("quota exceeded"),
        }
    );
    assert_eq!(err.to_string(), "gcloud exited with status 2: quota exceeded");
}

#[rstest]
fn check_reports_unknown_status_for_signals() {
    let output = CommandOutput::default();
    let err = output.check("make").expect_err("missing code should fail");
    assert!(err.to_string().contains("status unknown"), "got {err}");
}

#[rstest]
fn stdout_lines_skips_blank_lines() {
    let output = CommandOutput {
        code: Some(0),
        stdout: String::from("a\n\n  b  \n"),
        stderr: String::new(),
    };
    assert_eq!(output.stdout_lines(), vec!["a", "b"]);
}

#[rstest]
fn process_runner_captures_output_and_environment() {
    let spec = CommandSpec::new("sh")
        .args(["-c", "echo \"$KT2_PROBE\"; echo oops >&2; exit 3"])
        .env("KT2_PROBE", "hello");
    let output = ProcessCommandRunner.run(&spec).expect("sh should spawn");

    assert_eq!(output.code, Some(3));
    assert_eq!(output.stdout.trim(), "hello");
    assert_eq!(output.stderr.trim(), "oops");
}

#[rstest]
fn process_runner_discards_output() {
    let spec = CommandSpec::new("sh")
        .args(["-c", "echo hidden"])
        .output(OutputMode::Discard);
    let output = ProcessCommandRunner.run(&spec).expect("sh should spawn");

    assert!(output.is_success());
    assert!(output.stdout.is_empty());
}

#[rstest]
fn process_runner_honours_working_directory() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = camino::Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8 path");
    let spec = CommandSpec::new("pwd").current_dir(path.clone());
    let output = ProcessCommandRunner.run(&spec).expect("pwd should spawn");

    assert!(
        output.stdout.trim().ends_with(path.file_name().unwrap_or_default()),
        "stdout: {}",
        output.stdout
    );
}

#[rstest]
fn process_runner_reports_spawn_failures() {
    let spec = CommandSpec::new("kt2-definitely-not-a-binary");
    let err = ProcessCommandRunner
        .run(&spec)
        .expect_err("missing binary should fail to spawn");
    assert!(matches!(err, ProcessError::Spawn { .. }), "got {err:?}");
}

#[tokio::test]
async fn run_blocking_drives_runner_off_the_async_thread() {
    let runner = Arc::new(ProcessCommandRunner);
    let output = run_blocking(runner, CommandSpec::new("sh").args(["-c", "echo ok"]))
        .await
        .expect("sh should spawn");
    assert_eq!(output.stdout.trim(), "ok");
}

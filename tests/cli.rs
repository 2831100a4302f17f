use std::process::Command;

fn uploader() -> Command {
    Command::new(env!("CARGO_BIN_EXE_anaplan-uploader"))
}

#[test]
fn no_arguments_prints_usage_to_stderr_and_fails() {
    let out = uploader().output().unwrap();
    assert_eq!(out.status.code(), Some(1));
    assert!(out.stdout.is_empty());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("Usage"), "stderr was: {stderr}");
    assert!(stderr.contains("--file-to-upload"));
}

#[test]
fn unknown_flag_fails_with_exit_one() {
    let out = uploader().arg("--no-such-flag").output().unwrap();
    assert_eq!(out.status.code(), Some(1));
}

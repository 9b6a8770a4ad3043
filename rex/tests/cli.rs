use std::process::Command;

#[test]
fn test_rex_help_lists_subcommands() {
    let output = Command::new(env!("CARGO_BIN_EXE_rex"))
        .arg("--help")
        .output()
        .expect("failed to run rex --help");

    assert!(output.status.success(), "rex --help failed");
    let stdout = String::from_utf8_lossy(&output.stdout);
    for sub in ["exec", "machine", "update", "version"] {
        assert!(stdout.contains(sub), "missing {sub} in help: {stdout}");
    }
}

#[test]
fn test_rex_version_prints_semver() {
    let output = Command::new(env!("CARGO_BIN_EXE_rex"))
        .arg("version")
        .output()
        .expect("failed to run rex version");

    assert!(output.status.success());
    assert_eq!(
        String::from_utf8_lossy(&output.stdout).trim(),
        env!("CARGO_PKG_VERSION")
    );
}

#[test]
fn test_rex_unknown_machine_is_usage_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("config.yaml");
    std::fs::write(&config, "machines:\n  - name: m1\n    ssh: u@h\n").unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_rex"))
        .args([
            "exec",
            "result",
            "--config",
            &config.to_string_lossy(),
            "--machine",
            "ghost",
            "--id",
            "x",
        ])
        .output()
        .expect("failed to run rex");

    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("unknown machine: ghost"), "stderr: {stderr}");
}

#[test]
fn test_rex_watch_rejects_bad_stream() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("config.yaml");
    std::fs::write(&config, "machines:\n  - name: m1\n    ssh: u@h\n").unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_rex"))
        .args([
            "exec",
            "watch",
            "--config",
            &config.to_string_lossy(),
            "--machine",
            "m1",
            "--id",
            "x",
            "--stream",
            "bogus",
        ])
        .output()
        .expect("failed to run rex");

    assert_eq!(output.status.code(), Some(2));
}

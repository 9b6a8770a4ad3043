use std::process::Command;

#[test]
fn test_rexd_help_includes_usage() {
    let output = Command::new(env!("CARGO_BIN_EXE_rexd"))
        .arg("--help")
        .output()
        .expect("failed to run rexd --help");

    assert!(output.status.success(), "rexd --help failed");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("rexd"), "unexpected help output: {stdout}");
    assert!(stdout.contains("serve"), "serve subcommand missing: {stdout}");
}

#[test]
fn test_rexd_version_prints_semver() {
    let output = Command::new(env!("CARGO_BIN_EXE_rexd"))
        .arg("version")
        .output()
        .expect("failed to run rexd version");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(stdout.trim(), env!("CARGO_PKG_VERSION"));
}

#[test]
fn test_rexd_unknown_subcommand_is_usage_error() {
    let output = Command::new(env!("CARGO_BIN_EXE_rexd"))
        .arg("bogus")
        .output()
        .expect("failed to run rexd");

    assert_eq!(output.status.code(), Some(2));
}

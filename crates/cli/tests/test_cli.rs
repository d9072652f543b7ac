//! CLI contract tests: argument handling, exit codes and script
//! execution through the real binary.

use std::io::Write;
use std::process::Command;

fn solis() -> Command {
    Command::new(env!("CARGO_BIN_EXE_solis"))
}

fn write_script(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".solis")
        .tempfile()
        .expect("create temp script");
    file.write_all(contents.as_bytes()).expect("write script");
    file
}

#[test]
fn no_arguments_prints_help_and_succeeds() {
    let output = solis().output().expect("run solis");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Solis CLI Help"));
}

#[test]
fn version_command_reports_the_crate_version() {
    let output = solis().arg("version").output().expect("run solis");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn runs_a_script_file() {
    let script = write_script("print(\"hello from solis\")\nprint(1 + 2)\n");
    let output = solis().arg(script.path()).output().expect("run solis");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("hello from solis"));
    assert!(stdout.contains('3'));
}

#[test]
fn missing_file_exits_with_failure() {
    let output = solis()
        .arg("definitely-not-a-real-file.solis")
        .output()
        .expect("run solis");
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn interpretation_errors_do_not_set_exit_status() {
    let script = write_script("var x = \n");
    let output = solis().arg(script.path()).output().expect("run solis");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Compile Error"));

    let script = write_script("var x = missingFn()\n");
    let output = solis().arg(script.path()).output().expect("run solis");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Compile Error"));
}

#[test]
fn runtime_errors_are_reported_on_stderr() {
    let script = write_script("var x = 1 + \"one\"\n");
    let output = solis().arg(script.path()).output().expect("run solis");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stdout.contains("Runtime Error"));
    assert!(stderr.contains("[line 1]"));
}

#[test]
fn sandboxed_flag_hides_the_os_class() {
    let script = write_script("var p = OS.getPlatformString()\nprint(p)\n");
    let output = solis()
        .arg("--sandboxed")
        .arg(script.path())
        .output()
        .expect("run solis");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    // OS is unregistered, so the script fails to compile its reference.
    assert!(stdout.contains("Compile Error"));
}

#[test]
fn config_file_is_honored() {
    let mut config = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("create config");
    config
        .write_all(b"[vm]\nsandboxed = true\n")
        .expect("write config");

    let script = write_script("var p = OS.getPlatformString()\n");
    let output = solis()
        .arg("--config")
        .arg(config.path())
        .arg(script.path())
        .output()
        .expect("run solis");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Compile Error"));
}

#[test]
fn bad_config_file_is_an_error() {
    let mut config = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("create config");
    config.write_all(b"not valid toml [").expect("write config");

    let script = write_script("print(1)\n");
    let output = solis()
        .arg("--config")
        .arg(config.path())
        .arg(script.path())
        .output()
        .expect("run solis");
    assert_eq!(output.status.code(), Some(1));
}

use assert_cmd::Command;
use predicates::prelude::*;

fn taskmasterd() -> Command {
    Command::cargo_bin("taskmasterd").unwrap()
}

#[test]
fn help_describes_the_daemon() {
    taskmasterd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("supervision"))
        .stdout(predicate::str::contains("--configuration"));
}

#[test]
fn missing_config_file_exits_with_code_two() {
    taskmasterd()
        .args(["-c", "/definitely/not/here.conf"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("config"));
}

#[test]
fn broken_config_exits_with_code_two() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("broken.conf");
    std::fs::write(&config, "[program:x]\nnot a key value line\n").unwrap();

    taskmasterd()
        .args(["-c", config.to_str().unwrap()])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("syntax"));
}

#[test]
fn program_without_command_exits_with_code_two() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("nocmd.conf");
    std::fs::write(&config, "[program:x]\npriority = 1\n").unwrap();

    taskmasterd()
        .args(["-c", config.to_str().unwrap()])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("command"));
}

#[test]
fn unmet_minfds_exits_with_code_three() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("limits.conf");
    std::fs::write(
        &config,
        "[supervisord]\nminfds = 18446744073709551000\nnodaemon = true\n",
    )
    .unwrap();

    taskmasterd()
        .args(["-c", config.to_str().unwrap()])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("minfds"));
}

#[test]
fn bad_cli_override_exits_with_code_two() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("ok.conf");
    std::fs::write(&config, "[supervisord]\nnodaemon = true\n").unwrap();

    taskmasterd()
        .args(["-c", config.to_str().unwrap(), "--umask", "not-octal"])
        .assert()
        .code(2);
}

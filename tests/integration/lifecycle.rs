#[path = "common/mod.rs"]
mod common;

use std::{fs, thread, time::Duration};

use common::start_daemon;
use serde_json::json;

#[test]
fn priority_start_brings_everything_up_in_order() {
    let daemon = start_daemon(
        "",
        "[program:a]\ncommand = sleep 60\npriority = 1\nstartsecs = 0\n\
         [program:b]\ncommand = sleep 60\npriority = 2\nstartsecs = 0\n\
         [program:c]\ncommand = sleep 60\npriority = 2\nstartsecs = 0\n",
    );

    for name in ["a", "b", "c"] {
        daemon.wait_state(name, "RUNNING", Duration::from_secs(10));
    }

    let envelope = daemon.call("supervisor.getAllProcessInfo", json!([]));
    let records = envelope["result"].as_array().unwrap().clone();
    assert_eq!(records.len(), 3);

    // Records come back in start order: "a" was initiated first.
    assert_eq!(records[0]["name"], json!("a"));
    let a_start = records[0]["start"].as_i64().unwrap();
    let b_start = records[1]["start"].as_i64().unwrap();
    let c_start = records[2]["start"].as_i64().unwrap();
    assert!(a_start <= b_start.min(c_start));

    // Everyone has a distinct live pid.
    let mut pids: Vec<i64> = records
        .iter()
        .map(|r| r["pid"].as_i64().unwrap())
        .collect();
    pids.sort_unstable();
    pids.dedup();
    assert_eq!(pids.len(), 3);

    daemon.stop();
}

#[test]
fn unexpected_exits_exhaust_backoff_into_fatal() {
    let daemon = start_daemon(
        "backofflimit = 3",
        "[program:crashy]\ncommand = sh -c 'exit 1'\nautorestart = true\nexitcodes = 0,2\n",
    );

    // Three failed attempts with 1s/2s/3s backoffs in between.
    daemon.wait_state("crashy", "FATAL", Duration::from_secs(30));

    let info = daemon.call("supervisor.getProcessInfo", json!(["crashy"]));
    assert_eq!(info["result"]["exitstatus"], json!(1));
    assert!(info["result"]["spawnerr"].is_null());

    daemon.stop();
}

#[test]
fn expected_exit_settles_without_retry() {
    let daemon = start_daemon(
        "",
        "[program:clean]\ncommand = sh -c 'exit 2'\nexitcodes = 0,2\n",
    );

    daemon.wait_state("clean", "EXITED", Duration::from_secs(10));
    let info = daemon.call("supervisor.getProcessInfo", json!(["clean"]));
    assert_eq!(info["result"]["exitstatus"], json!(2));

    // No retry: still EXITED well past any backoff delay.
    thread::sleep(Duration::from_secs(2));
    assert_eq!(daemon.state_of("clean"), "EXITED");

    daemon.stop();
}

#[test]
fn autorestart_respawns_after_expected_exit() {
    let scratch = tempfile::tempdir().unwrap();
    let marker = scratch.path().join("runs.txt");
    let program = format!(
        "[program:echoer]\ncommand = sh -c 'echo run >> {}'\n\
         autorestart = true\nexitcodes = 0\nstartsecs = 0\n",
        marker.display()
    );

    let daemon = start_daemon("", &program);
    common::wait_for(Duration::from_secs(15), "three respawns", || {
        fs::read_to_string(&marker)
            .map(|text| text.lines().count() >= 3)
            .unwrap_or(false)
    });
    daemon.stop();
}

#[test]
fn start_process_is_refused_while_running() {
    let daemon = start_daemon(
        "",
        "[program:sleeper]\ncommand = sleep 60\nstartsecs = 0\n",
    );
    daemon.wait_state("sleeper", "RUNNING", Duration::from_secs(10));

    let envelope = daemon.call("supervisor.startProcess", json!(["sleeper", false]));
    assert_eq!(envelope["fault"]["code"], json!(60));

    daemon.stop();
}

#[test]
fn stopped_process_restarts_on_command() {
    let daemon = start_daemon(
        "",
        "[program:sleeper]\ncommand = sleep 60\nstartsecs = 0\n",
    );
    daemon.wait_state("sleeper", "RUNNING", Duration::from_secs(10));
    let first_pid = daemon.call("supervisor.getProcessInfo", json!(["sleeper"]))["result"]
        ["pid"]
        .as_i64()
        .unwrap();

    let envelope = daemon.call("supervisor.stopProcess", json!(["sleeper", true]));
    assert_eq!(envelope["result"], json!(true));
    assert_eq!(daemon.state_of("sleeper"), "STOPPED");

    let envelope = daemon.call("supervisor.startProcess", json!(["sleeper", true]));
    assert_eq!(envelope["result"], json!(true));
    assert_eq!(daemon.state_of("sleeper"), "RUNNING");

    let second_pid = daemon.call("supervisor.getProcessInfo", json!(["sleeper"]))["result"]
        ["pid"]
        .as_i64()
        .unwrap();
    assert_ne!(first_pid, second_pid);

    daemon.stop();
}

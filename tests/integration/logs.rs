#[path = "common/mod.rs"]
mod common;

use std::{fs, path::PathBuf, time::Duration};

use common::{start_daemon, wait_for};
use serde_json::json;

#[test]
fn child_stdout_is_captured_into_the_auto_log() {
    let daemon = start_daemon(
        "",
        "[program:talker]\ncommand = sh -c 'echo hello from child; sleep 60'\nstartsecs = 0\n",
    );
    daemon.wait_state("talker", "RUNNING", Duration::from_secs(10));

    let info = daemon.call("supervisor.getProcessInfo", json!(["talker"]));
    let logfile = PathBuf::from(info["result"]["logfile"].as_str().unwrap());

    wait_for(Duration::from_secs(10), "captured stdout", || {
        fs::read_to_string(&logfile)
            .map(|text| text.contains("hello from child"))
            .unwrap_or(false)
    });

    // The same bytes are visible through the RPC surface.
    wait_for(Duration::from_secs(10), "readProcessLog content", || {
        let envelope = daemon.call(
            "supervisor.readProcessLog",
            json!(["talker", 0, 0]),
        );
        envelope["result"]
            .as_str()
            .is_some_and(|text| text.contains("hello from child"))
    });

    daemon.stop();
}

#[test]
fn stderr_is_captured_only_when_log_stderr_is_set() {
    let daemon = start_daemon(
        "",
        "[program:errs]\ncommand = sh -c 'echo oops >&2; sleep 60'\n\
         startsecs = 0\nlog_stderr = true\n\
         [program:quiet]\ncommand = sh -c 'echo shh >&2; sleep 60'\n\
         startsecs = 0\n",
    );
    daemon.wait_state("errs", "RUNNING", Duration::from_secs(10));
    daemon.wait_state("quiet", "RUNNING", Duration::from_secs(10));

    wait_for(Duration::from_secs(10), "captured stderr", || {
        let envelope = daemon.call("supervisor.readProcessLog", json!(["errs", 0, 0]));
        envelope["result"].as_str().is_some_and(|t| t.contains("oops"))
    });

    // Give the discarded stream a moment, then confirm nothing was kept.
    std::thread::sleep(Duration::from_millis(500));
    let envelope = daemon.call("supervisor.readProcessLog", json!(["quiet", 0, 0]));
    assert!(!envelope["result"].as_str().unwrap().contains("shh"));

    daemon.stop();
}

#[test]
fn tail_reports_endpoint_offset_and_overflow() {
    let daemon = start_daemon(
        "",
        "[program:talker]\ncommand = sh -c 'echo 0123456789; sleep 60'\nstartsecs = 0\n",
    );
    daemon.wait_state("talker", "RUNNING", Duration::from_secs(10));
    wait_for(Duration::from_secs(10), "log content", || {
        daemon.call("supervisor.readProcessLog", json!(["talker", 0, 0]))["result"]
            .as_str()
            .is_some_and(|t| !t.is_empty())
    });

    // 11 bytes on disk ("0123456789\n"); a 4-byte tail from offset 0 skips.
    let envelope = daemon.call("supervisor.tailProcessLog", json!(["talker", 0, 4]));
    let result = envelope["result"].as_array().unwrap();
    assert_eq!(result[0], json!("6789\n"));
    assert_eq!(result[1], json!(11));
    assert_eq!(result[2], json!(true));

    // Caught-up reader sees no overflow.
    let envelope = daemon.call("supervisor.tailProcessLog", json!(["talker", 11, 100]));
    let result = envelope["result"].as_array().unwrap();
    assert_eq!(result[0], json!(""));
    assert_eq!(result[2], json!(false));

    daemon.stop();
}

#[test]
fn clear_process_log_truncates_on_disk() {
    let daemon = start_daemon(
        "",
        "[program:talker]\ncommand = sh -c 'echo data; sleep 60'\nstartsecs = 0\n",
    );
    daemon.wait_state("talker", "RUNNING", Duration::from_secs(10));
    wait_for(Duration::from_secs(10), "log content", || {
        daemon.call("supervisor.readProcessLog", json!(["talker", 0, 0]))["result"]
            .as_str()
            .is_some_and(|t| !t.is_empty())
    });

    let envelope = daemon.call("supervisor.clearProcessLog", json!(["talker"]));
    assert_eq!(envelope["result"], json!(true));

    let envelope = daemon.call("supervisor.readProcessLog", json!(["talker", 0, 0]));
    assert_eq!(envelope["result"], json!(""));

    daemon.stop();
}

#[test]
fn activity_log_surface_responds() {
    let daemon = start_daemon("", "");

    let envelope = daemon.call("supervisor.readLog", json!([0, 0]));
    assert!(envelope["result"].is_string());

    let envelope = daemon.call("supervisor.clearLog", json!([]));
    assert_eq!(envelope["result"], json!(true));

    daemon.stop();
}

#[test]
fn none_policy_discards_output_entirely() {
    let daemon = start_daemon(
        "",
        "[program:void]\ncommand = sh -c 'echo gone; sleep 60'\n\
         startsecs = 0\nlogfile = NONE\n",
    );
    daemon.wait_state("void", "RUNNING", Duration::from_secs(10));

    let info = daemon.call("supervisor.getProcessInfo", json!(["void"]));
    assert!(info["result"]["logfile"].is_null());

    let envelope = daemon.call("supervisor.readProcessLog", json!(["void", 0, 0]));
    assert_eq!(envelope["fault"]["code"], json!(20));

    daemon.stop();
}

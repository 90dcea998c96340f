#[path = "common/mod.rs"]
mod common;

use std::time::Duration;

use common::{http_post, http_post_path, start_daemon};
use serde_json::json;

#[test]
fn basic_auth_gates_every_request() {
    let daemon = start_daemon(
        "http_username = u\nhttp_password = p",
        "[program:sleeper]\ncommand = sleep 60\nstartsecs = 0\n",
    );

    let body = json!({"method": "supervisor.getState", "params": []}).to_string();

    // No credentials.
    let (status, _) = http_post(&daemon.socket, &body, None);
    assert!(status.contains("401"), "got: {status}");

    // Wrong credentials.
    let (status, _) = http_post(&daemon.socket, &body, Some(("u", "nope")));
    assert!(status.contains("401"), "got: {status}");

    // Correct credentials.
    let (status, response) = http_post(&daemon.socket, &body, Some(("u", "p")));
    assert!(status.contains("200"), "got: {status}");
    let envelope: serde_json::Value = serde_json::from_str(&response).unwrap();
    assert_eq!(envelope["result"]["statename"], json!("RUNNING"));
    assert_eq!(envelope["result"]["statecode"], json!(1));

    daemon.stop();
}

#[test]
fn non_rpc_paths_are_not_served() {
    let daemon = start_daemon("", "");
    let (status, _) = http_post_path(&daemon.socket, "/index.html", "{}", None);
    assert!(status.contains("404"), "got: {status}");
    daemon.stop();
}

#[test]
fn malformed_body_is_a_fault_not_a_crash() {
    let daemon = start_daemon("", "");
    let (status, body) = http_post(&daemon.socket, "this is not json", None);
    assert!(status.contains("200"), "got: {status}");
    let envelope: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(envelope["fault"]["code"], json!(2));

    // The server survived: a well-formed call still works.
    let envelope = daemon.call("supervisor.getPID", json!([]));
    assert_eq!(envelope["result"], json!(std::process::id()));
    daemon.stop();
}

#[test]
fn introspection_surface() {
    let daemon = start_daemon("", "");

    let envelope = daemon.call("supervisor.getVersion", json!([]));
    assert_eq!(envelope["result"], json!(env!("CARGO_PKG_VERSION")));

    let envelope = daemon.call("system.listMethods", json!([]));
    let names = envelope["result"].as_array().unwrap();
    assert!(names.iter().any(|n| n == "system.multicall"));
    assert!(names.iter().any(|n| n == "supervisor.tailProcessLog"));

    let envelope = daemon.call("system.methodHelp", json!(["supervisor.shutdown"]));
    assert!(envelope["result"].as_str().unwrap().contains("down"));

    daemon.stop();
}

#[test]
fn multicall_responses_match_call_order() {
    let daemon = start_daemon(
        "",
        "[program:sleeper]\ncommand = sleep 60\nstartsecs = 0\n",
    );
    daemon.wait_state("sleeper", "RUNNING", Duration::from_secs(10));

    let envelope = daemon.call(
        "system.multicall",
        json!([[
            { "method": "supervisor.getPID" },
            { "method": "supervisor.getProcessInfo", "params": ["sleeper"] },
            { "method": "supervisor.getProcessInfo", "params": ["ghost"] },
        ]]),
    );
    let responses = envelope["result"].as_array().unwrap();
    assert_eq!(responses.len(), 3);
    assert_eq!(responses[0]["result"], json!(std::process::id()));
    assert_eq!(responses[1]["result"]["name"], json!("sleeper"));
    assert_eq!(responses[2]["fault"]["code"], json!(10));

    daemon.stop();
}

#[test]
fn wait_calls_park_until_the_state_machine_fires() {
    let daemon = start_daemon(
        "",
        "[program:slow]\ncommand = sleep 60\nstartsecs = 1\nautostart = false\n",
    );

    // startProcess(wait=true) resolves only after startsecs in RUNNING.
    let begun = std::time::Instant::now();
    let envelope = daemon.call("supervisor.startProcess", json!(["slow", true]));
    assert_eq!(envelope["result"], json!(true));
    assert!(begun.elapsed() >= Duration::from_secs(1));
    assert_eq!(daemon.state_of("slow"), "RUNNING");

    daemon.stop();
}

#[test]
fn start_wait_reports_a_spawn_error_fault() {
    let daemon = start_daemon(
        "backofflimit = 2",
        "[program:doomed]\ncommand = sh -c 'exit 9'\nautostart = false\n",
    );

    let envelope = daemon.call("supervisor.startProcess", json!(["doomed", true]));
    assert_eq!(envelope["fault"]["code"], json!(50));

    daemon.stop();
}

#[test]
fn restart_call_stops_then_starts_everything() {
    let daemon = start_daemon(
        "",
        "[program:a]\ncommand = sleep 60\nstartsecs = 0\npriority = 1\n\
         [program:b]\ncommand = sleep 60\nstartsecs = 0\npriority = 2\n",
    );
    daemon.wait_state("a", "RUNNING", Duration::from_secs(10));
    daemon.wait_state("b", "RUNNING", Duration::from_secs(10));
    let a_pid = daemon.call("supervisor.getProcessInfo", json!(["a"]))["result"]["pid"]
        .as_i64()
        .unwrap();

    let envelope = daemon.call("supervisor.restart", json!([]));
    assert_eq!(envelope["result"], json!(true));

    assert_eq!(daemon.state_of("a"), "RUNNING");
    assert_eq!(daemon.state_of("b"), "RUNNING");
    let new_a_pid = daemon.call("supervisor.getProcessInfo", json!(["a"]))["result"]["pid"]
        .as_i64()
        .unwrap();
    assert_ne!(a_pid, new_a_pid);

    daemon.stop();
}

#[test]
fn shutdown_unlinks_the_socket() {
    let daemon = start_daemon("", "");
    let socket = daemon.socket.clone();
    assert!(socket.exists());
    daemon.stop();
    assert!(!socket.exists());
}

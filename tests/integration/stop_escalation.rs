#[path = "common/mod.rs"]
mod common;

use std::time::{Duration, Instant};

use common::start_daemon;
use serde_json::json;

#[test]
fn term_ignoring_child_is_killed_after_the_grace_period() {
    let daemon = start_daemon(
        "",
        "[program:stubborn]\ncommand = sh -c 'trap \"\" TERM; sleep 60'\n\
         startsecs = 0\nstopwaitsecs = 2\n",
    );
    daemon.wait_state("stubborn", "RUNNING", Duration::from_secs(10));

    let begun = Instant::now();
    let envelope = daemon.call("supervisor.stopProcess", json!(["stubborn", true]));
    let elapsed = begun.elapsed();

    assert_eq!(envelope["result"], json!(true));
    // The response only lands after SIGKILL escalation.
    assert!(
        elapsed >= Duration::from_secs(2),
        "stopped in {elapsed:?}, before the grace period"
    );
    assert_eq!(daemon.state_of("stubborn"), "STOPPED");
    assert!(daemon.call("supervisor.getProcessInfo", json!(["stubborn"]))["result"]["pid"]
        .is_null());

    daemon.stop();
}

#[test]
fn cooperative_child_stops_before_the_grace_period() {
    let daemon = start_daemon(
        "",
        "[program:polite]\ncommand = sleep 60\nstartsecs = 0\nstopwaitsecs = 10\n",
    );
    daemon.wait_state("polite", "RUNNING", Duration::from_secs(10));

    let begun = Instant::now();
    let envelope = daemon.call("supervisor.stopProcess", json!(["polite", true]));
    assert_eq!(envelope["result"], json!(true));
    assert!(begun.elapsed() < Duration::from_secs(8));
    assert_eq!(daemon.state_of("polite"), "STOPPED");

    daemon.stop();
}

#[test]
fn second_stop_while_stopping_is_idempotent() {
    let daemon = start_daemon(
        "",
        "[program:stubborn]\ncommand = sh -c 'trap \"\" TERM; sleep 60'\n\
         startsecs = 0\nstopwaitsecs = 3\n",
    );
    daemon.wait_state("stubborn", "RUNNING", Duration::from_secs(10));

    // Fire-and-forget stop, then observe STOPPING.
    let envelope = daemon.call("supervisor.stopProcess", json!(["stubborn", false]));
    assert_eq!(envelope["result"], json!(true));
    daemon.wait_state("stubborn", "STOPPING", Duration::from_secs(5));

    // A second stop is accepted and changes nothing.
    let envelope = daemon.call("supervisor.stopProcess", json!(["stubborn", false]));
    assert_eq!(envelope["result"], json!(true));
    assert_eq!(daemon.state_of("stubborn"), "STOPPING");

    daemon.wait_state("stubborn", "STOPPED", Duration::from_secs(15));
    daemon.stop();
}

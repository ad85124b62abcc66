//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production code MUST NOT sleep. Waiting is done on I/O,
//! `tokio::time::timeout` or `tokio::time::interval`, never on a timer
//! standing in for an event.

use architectural_enforcement::{report, violations};

/// Test that production code does not contain sleep() calls
#[test]
fn test_no_sleep_in_production_code() {
    let found = violations(|code| {
        code.contains("thread::sleep(")
            || code.contains("time::sleep(")
            || code.contains("::sleep_until(")
    });

    report(
        "CRITICAL: Sleep calls found in production code!",
        "Use tokio::time::timeout for deadlines and tokio::time::interval for periodic work",
        &found,
    );
}

/// Test that nothing blocks a runtime thread on network I/O
#[test]
fn test_no_blocking_network_clients() {
    let found = violations(|code| {
        code.contains("reqwest::blocking")
            || code.contains("std::net::TcpStream")
            || code.contains("std::net::TcpListener")
    });

    report(
        "CRITICAL: Blocking network I/O found in production code!",
        "Use reqwest async clients and tokio::net",
        &found,
    );
}

//! Integration Test: Crate Layering
//!
//! **Policy**: `balancer-core` is a library with no HTTP server of its own.
//! Serving, CLI parsing and subscriber setup belong to `balancer-daemon`.

use std::fs;

use architectural_enforcement::{violations, workspace_root};

/// Crates that only the daemon may depend on
const SERVER_SIDE_CRATES: [&str; 5] = ["axum", "tower-http", "hyper-util", "clap", "tracing-subscriber"];

fn dependency_names(manifest: &str) -> Vec<String> {
    let mut in_deps = false;
    let mut names = Vec::new();
    for line in manifest.lines() {
        let line = line.trim();
        if line.starts_with('[') {
            in_deps = line == "[dependencies]";
            continue;
        }
        if in_deps && !line.starts_with('#') {
            if let Some((name, _)) = line.split_once('=') {
                names.push(name.trim().to_string());
            }
        }
    }
    names
}

#[test]
fn test_core_has_no_server_dependencies() {
    let manifest = fs::read_to_string(workspace_root().join("balancer/core/Cargo.toml")).unwrap();
    let deps = dependency_names(&manifest);

    let forbidden: Vec<&str> = SERVER_SIDE_CRATES
        .iter()
        .copied()
        .filter(|c| deps.iter().any(|d| d == c))
        .collect();

    assert!(
        forbidden.is_empty(),
        "balancer-core must not depend on {forbidden:?}; move that code to balancer-daemon"
    );
}

#[test]
fn test_core_source_does_not_reach_for_the_daemon() {
    let found: Vec<_> = violations(|code| code.contains("axum::") || code.contains("balancer_daemon"))
        .into_iter()
        .filter(|line| line.path.to_string_lossy().contains("balancer/core/"))
        .collect();

    assert!(
        found.is_empty(),
        "core source references server-side code:\n{}",
        found.iter().map(ToString::to_string).collect::<Vec<_>>().join("\n")
    );
}

#[test]
fn test_dependency_parser() {
    let manifest = "[package]\nname = \"x\"\n\n[dependencies]\n# comment\ntokio = \"1\"\nserde = { version = \"1\" }\n\n[dev-dependencies]\naxum = \"0.8\"\n";
    assert_eq!(dependency_names(manifest), vec!["tokio", "serde"]);
}

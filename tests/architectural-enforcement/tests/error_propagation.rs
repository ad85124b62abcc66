//! Integration Test: Error Propagation
//!
//! **Policy**: Production code propagates errors with `?` and typed error
//! enums. `unwrap()` and `expect()` are allowed only in tests and
//! test-only helper modules.

use architectural_enforcement::{report, violations};

#[test]
fn test_no_unwrap_or_expect_in_production_code() {
    let found = violations(|code| code.contains(".unwrap()") || code.contains(".expect("));

    report(
        "CRITICAL: unwrap()/expect() found in production code!",
        "Return a Result and propagate with `?`, or fall back with unwrap_or/unwrap_or_else",
        &found,
    );
}

#[test]
fn test_no_panicking_macros_in_production_code() {
    let found = violations(|code| {
        code.contains("panic!(") || code.contains("todo!(") || code.contains("unimplemented!(")
    });

    report(
        "CRITICAL: Panicking macros found in production code!",
        "Turn the failure into an error variant",
        &found,
    );
}

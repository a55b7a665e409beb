//! Integration Test: Sleep Prohibition
//!
//! **Policy**: production code never blocks a thread with `std::thread::sleep`.
//! Async sleeps are allowed only for retry backoff and for deliberate pacing
//! (provider simulation delays); timers that wait for events use deadlines,
//! `interval` or channels instead.

use architectural_enforcement::{code_part, has_context, scan};

#[test]
fn test_no_blocking_sleep() {
    let violations = scan(|_, lines, idx| {
        let code = code_part(lines[idx]);
        code.contains("thread::sleep(")
    });
    assert!(
        violations.is_empty(),
        "blocking sleep in production code:\n{}",
        violations
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    );
}

#[test]
fn test_async_sleep_only_for_backoff_or_pacing() {
    let violations = scan(|_, lines, idx| {
        let code = code_part(lines[idx]);
        if !code.contains("time::sleep(") {
            return false;
        }
        let backoff = has_context(lines, idx, 15, 2, &["backoff"])
            && has_context(lines, idx, 15, 2, &["attempt", "retry"]);
        let pacing = has_context(lines, idx, 3, 0, &["delay", "pause"]);
        !(backoff || pacing)
    });
    assert!(
        violations.is_empty(),
        "async sleep used as synchronization:\n{}",
        violations
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    );
}

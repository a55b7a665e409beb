//! Integration Test: Logging and Panic Discipline
//!
//! **Policy**: library and daemon code log through `tracing`, never print,
//! and propagate errors instead of unwrapping outside tests. The only
//! allowance is `expect` on `Regex::new` over a `*_PATTERN` constant.

use architectural_enforcement::{code_part, scan};

fn report(violations: &[architectural_enforcement::Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

#[test]
fn test_no_print_macros() {
    let violations = scan(|_, lines, idx| {
        let code = code_part(lines[idx]);
        ["println!(", "eprintln!(", "print!(", "eprint!(", "dbg!("]
            .iter()
            .any(|m| code.contains(m))
    });
    assert!(violations.is_empty(), "print macros in production code:\n{}", report(&violations));
}

/// Compiling a constant regex is the one place `expect` states an invariant
fn is_constant_regex(code: &str) -> bool {
    code.contains("Regex::new(") && code.contains("_PATTERN).expect(")
}

#[test]
fn test_no_unwrap_or_expect() {
    let violations = scan(|_, lines, idx| {
        let code = code_part(lines[idx]);
        code.contains(".unwrap()") || (code.contains(".expect(") && !is_constant_regex(code))
    });
    assert!(violations.is_empty(), "unwrap/expect in production code:\n{}", report(&violations));
}

#[test]
fn test_constant_regex_allowance_is_narrow() {
    assert!(is_constant_regex(
        r#"RE.get_or_init(|| Regex::new(FENCE_PATTERN).expect("valid"))"#
    ));
    assert!(!is_constant_regex(r#"Regex::new(&user_input).expect("valid")"#));
    assert!(!is_constant_regex(r#"config.get("x").expect("present")"#));
}

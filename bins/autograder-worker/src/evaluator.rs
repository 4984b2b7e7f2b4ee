//! Outcome Evaluator - turns raw sandbox results into graded outcomes
//!
//! **Core Responsibility:**
//! Judge execution output against the expectation of each spec kind.
//!
//! **Critical Properties:**
//! - Knows nothing about Docker or processes
//! - Knows nothing about the grading store
//! - Pure functions: (execution results, expectations) → Outcome
//!
//! **Normalization Rules:**
//! - Trim leading and trailing whitespace: YES
//! - Internal whitespace and case: preserved, exact match required
//! - A timed-out run is a failure regardless of its output

use autograder_common::types::{truncate_text, ExecutionResult, Outcome, Tally, TestCase};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use tracing::warn;

lazy_static! {
    /// One dot per passing assertion
    static ref ALL_DOTS: Regex = Regex::new(r"^\.+\s*$").unwrap();
}

pub const TIMEOUT_NOTICE: &str = "Time limit exceeded";

/// Per-case budget for output quoted in a testcases report
pub const MAX_CASE_EXCERPT_BYTES: usize = 2 * 1024;

fn normalize_output(output: &str) -> &str {
    output.trim()
}

fn timed_out_output(result: &ExecutionResult) -> String {
    if result.output.trim().is_empty() {
        TIMEOUT_NOTICE.to_string()
    } else {
        format!("{}\n{}", result.output.trim_end(), TIMEOUT_NOTICE)
    }
}

/// Embedded test code prints nothing or a line of dots on success.
///
/// A zero-assertion test prints nothing and is indistinguishable from a
/// fully passing one.
pub fn evaluate_testcode(result: &ExecutionResult) -> Outcome {
    if result.timed_out {
        return Outcome::fail(timed_out_output(result));
    }

    let output = normalize_output(&result.output);
    let first_line = output.lines().next().unwrap_or("");
    if output.is_empty() || ALL_DOTS.is_match(first_line) {
        Outcome::pass(result.output.clone())
    } else {
        Outcome::fail(result.output.clone())
    }
}

/// Whether one case's run matches its expected output
pub fn case_passed(case: &TestCase, result: &ExecutionResult) -> bool {
    !result.timed_out && normalize_output(&result.output) == normalize_output(&case.expected_output)
}

/// One run per case, paired by position. Missing results count as failures.
pub fn evaluate_testcases(cases: &[TestCase], results: &[ExecutionResult]) -> Outcome {
    if cases.is_empty() {
        warn!("Testcases spec has no cases, reporting vacuous success");
        return Outcome::from_tally(Tally::new(0, 0), Tally::new(0, 0).to_string());
    }

    let mut passed = 0;
    let mut report = Vec::new();

    for (position, case) in cases.iter().enumerate() {
        let number = position + 1;
        match results.get(position) {
            Some(result) if case_passed(case, result) => {
                passed += 1;
            }
            Some(result) if result.timed_out => {
                let partial = normalize_output(&result.output);
                if partial.is_empty() {
                    report.push(format!("case {}: {}", number, TIMEOUT_NOTICE.to_lowercase()));
                } else {
                    report.push(format!(
                        "case {}: {}, got {:?}",
                        number,
                        TIMEOUT_NOTICE.to_lowercase(),
                        truncate_text(partial, MAX_CASE_EXCERPT_BYTES)
                    ));
                }
            }
            Some(result) => {
                report.push(format!(
                    "case {}: expected {:?}, got {:?}",
                    number,
                    truncate_text(normalize_output(&case.expected_output), MAX_CASE_EXCERPT_BYTES),
                    truncate_text(normalize_output(&result.output), MAX_CASE_EXCERPT_BYTES)
                ));
            }
            None => {
                report.push(format!("case {}: not executed", number));
            }
        }
    }

    let tally = Tally::new(passed, cases.len());
    report.push(tally.to_string());
    Outcome::from_tally(tally, report.join("\n"))
}

/// Problem-config verdict for one case.
///
/// With a stage model the last output line must be the model's JSON outcome
/// carrying `successful`; declared expected text is then matched against
/// everything printed before it. Without a model the whole output is matched.
pub fn evaluate_problem_case(result: &ExecutionResult, expected: Option<&str>, has_model: bool) -> Outcome {
    if result.timed_out {
        return Outcome::fail(timed_out_output(result));
    }

    let output = normalize_output(&result.output);

    if !has_model {
        let expected = expected.unwrap_or("");
        return if output == normalize_output(expected) {
            Outcome::pass(result.output.clone())
        } else {
            Outcome::fail(result.output.clone())
        };
    }

    let (printed, last_line) = match output.rfind('\n') {
        Some(index) => (&output[..index], &output[index + 1..]),
        None => ("", output),
    };

    let successful = match serde_json::from_str::<Value>(last_line.trim()) {
        Ok(verdict) => match verdict.get("successful").and_then(Value::as_bool) {
            Some(flag) => flag,
            None => {
                warn!(line = %last_line, "Stage outcome carries no successful flag");
                return Outcome::fail(result.output.clone());
            }
        },
        Err(e) => {
            warn!(error = %e, "Last output line is not a stage outcome");
            return Outcome::fail(result.output.clone());
        }
    };

    let matches_expected = match expected {
        Some(expected) => normalize_output(printed) == normalize_output(expected),
        None => true,
    };

    if successful && matches_expected {
        Outcome::pass(result.output.clone())
    } else {
        Outcome::fail(result.output.clone())
    }
}

/// Fold per-case problem outcomes into one tallied outcome
pub fn tally_problem_cases(outcomes: &[Outcome]) -> Outcome {
    let passed = outcomes.iter().filter(|outcome| outcome.success).count();
    let tally = Tally::new(passed, outcomes.len());

    let output = if outcomes.len() == 1 {
        outcomes[0].output.clone()
    } else {
        let mut sections: Vec<String> = outcomes
            .iter()
            .enumerate()
            .map(|(position, outcome)| {
                let verdict = if outcome.success { "passed" } else { "failed" };
                format!("case {} {}:\n{}", position + 1, verdict, outcome.output.trim_end())
            })
            .collect();
        sections.push(tally.to_string());
        sections.join("\n")
    };

    Outcome::from_tally(tally, output)
}

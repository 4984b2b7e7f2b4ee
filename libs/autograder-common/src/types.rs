use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Structural family of a test specification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpecKind {
    /// Harness template with `[[[header]]]`/`[[[code]]]`/`[[[footer]]]` placeholders
    Code,
    /// Ordered (input, expected output) pairs
    Cases,
    /// Problem config with a simulated stage model
    Problem,
}

impl fmt::Display for SpecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpecKind::Code => write!(f, "testcode"),
            SpecKind::Cases => write!(f, "testcases"),
            SpecKind::Problem => write!(f, "problem"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub input: String,
    pub expected_output: String,
}

impl TestCase {
    pub fn new(input: impl Into<String>, expected_output: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            expected_output: expected_output.into(),
        }
    }
}

/// One entry of `problem.testCases` in a problem config
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProblemCase {
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub output: Option<String>,
    /// Replaces the stage data for this case only
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

/// Parsed test specification for one question. Immutable once parsed.
#[derive(Debug, Clone, PartialEq)]
pub enum TestSpec {
    Code {
        template: String,
    },
    Cases {
        cases: Vec<TestCase>,
        run_template: Option<String>,
    },
    Problem {
        stage_type: Option<String>,
        stage_data: serde_json::Value,
        test_cases: Option<Vec<ProblemCase>>,
    },
}

impl TestSpec {
    /// The spec a question gets when nothing was declared for it.
    pub fn empty() -> Self {
        TestSpec::Code {
            template: String::new(),
        }
    }

    pub fn kind(&self) -> SpecKind {
        match self {
            TestSpec::Code { .. } => SpecKind::Code,
            TestSpec::Cases { .. } => SpecKind::Cases,
            TestSpec::Problem { .. } => SpecKind::Problem,
        }
    }
}

/// A student's answer to one question
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub id: i64,
    #[serde(default)]
    pub username: String,
    pub question_index: usize,
    #[serde(rename = "answer")]
    pub answer_source: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(rename = "score", default)]
    pub current_score: Option<f64>,
}

/// An assignment together with every submission made to it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentSubmissions {
    pub assignment_url: String,
    #[serde(default)]
    pub submissions: Vec<Submission>,
}

/// One sandbox run. Ephemeral, built per attempt.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub source: String,
    pub stdin: String,
    pub timeout_seconds: u64,
    /// Name of the scratch file the source is written to
    pub file_name: String,
}

/// Raw result of a sandbox run, consumed once by the evaluator.
///
/// When `timed_out` is set the exit code is not meaningful; `output` holds
/// whatever was captured before the process was killed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionResult {
    pub exit_code: Option<i64>,
    pub output: String,
    pub timed_out: bool,
}

/// Passed/total counter, rendered as `p/n`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub passed: usize,
    pub total: usize,
}

impl Tally {
    pub fn new(passed: usize, total: usize) -> Self {
        Self { passed, total }
    }

    pub fn all_passed(&self) -> bool {
        self.passed == self.total
    }

    /// Fraction of passed cases. An empty tally counts as complete.
    pub fn ratio(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.passed as f64 / self.total as f64
        }
    }
}

impl fmt::Display for Tally {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.passed, self.total)
    }
}

/// Terminal result of grading one submission against one question's spec
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub success: bool,
    /// Always within `[0, 1]`
    pub score: f64,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tally: Option<Tally>,
}

impl Outcome {
    pub fn pass(output: impl Into<String>) -> Self {
        Self {
            success: true,
            score: 1.0,
            output: output.into(),
            tally: None,
        }
    }

    pub fn fail(output: impl Into<String>) -> Self {
        Self {
            success: false,
            score: 0.0,
            output: output.into(),
            tally: None,
        }
    }

    pub fn from_tally(tally: Tally, output: impl Into<String>) -> Self {
        Self {
            success: tally.all_passed(),
            score: tally.ratio().clamp(0.0, 1.0),
            output: output.into(),
            tally: Some(tally),
        }
    }
}

/// Largest `score_output` pushed to the grading store, in bytes
pub const MAX_SCORE_OUTPUT_BYTES: usize = 64 * 1024;
pub const TRUNCATION_MARKER: &str = "...[truncated]";

/// Cut `text` to at most `limit` bytes on a character boundary, marking the cut
pub fn truncate_text(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut end = limit.saturating_sub(TRUNCATION_MARKER.len());
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{}", &text[..end], TRUNCATION_MARKER)
}

/// Score record pushed to the grading store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreUpdate {
    pub id: i64,
    pub score: f64,
    pub score_output: String,
    pub timestamp: DateTime<Utc>,
}

impl ScoreUpdate {
    pub fn from_outcome(submission_id: i64, outcome: &Outcome) -> Self {
        Self {
            id: submission_id,
            score: outcome.score,
            score_output: truncate_text(&outcome.output, MAX_SCORE_OUTPUT_BYTES),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tally_display() {
        assert_eq!(Tally::new(2, 3).to_string(), "2/3");
        assert_eq!(Tally::new(0, 0).to_string(), "0/0");
    }

    #[test]
    fn test_empty_tally_is_complete() {
        let outcome = Outcome::from_tally(Tally::new(0, 0), "");
        assert!(outcome.success);
        assert_eq!(outcome.score, 1.0);
    }

    #[test]
    fn test_partial_tally_score() {
        let outcome = Outcome::from_tally(Tally::new(1, 4), "");
        assert!(!outcome.success);
        assert_eq!(outcome.score, 0.25);
    }

    #[test]
    fn test_submission_from_classroom_json() {
        let json = r#"{"id": 7, "username": "ana", "question_index": 1, "answer": "print(1)", "score": null}"#;
        let submission: Submission = serde_json::from_str(json).unwrap();
        assert_eq!(submission.id, 7);
        assert_eq!(submission.question_index, 1);
        assert_eq!(submission.answer_source, "print(1)");
        assert_eq!(submission.current_score, None);
        assert_eq!(submission.language, None);
    }

    #[test]
    fn test_spec_kind_names() {
        assert_eq!(TestSpec::empty().kind(), SpecKind::Code);
        assert_eq!(SpecKind::Cases.to_string(), "testcases");
    }

    #[test]
    fn test_truncate_text() {
        assert_eq!(truncate_text("short", 64), "short");

        let cut = truncate_text("ááááááááááááááááááááá", 20);
        assert!(cut.len() <= 20);
        assert!(cut.ends_with(TRUNCATION_MARKER));
        assert!(cut.starts_with("á"));
    }

    #[test]
    fn test_score_output_is_bounded() {
        let outcome = Outcome::fail("x".repeat(10 * 1024 * 1024));
        let update = ScoreUpdate::from_outcome(3, &outcome);
        assert_eq!(update.score_output.len(), MAX_SCORE_OUTPUT_BYTES);
        assert!(update.score_output.ends_with(TRUNCATION_MARKER));
    }
}

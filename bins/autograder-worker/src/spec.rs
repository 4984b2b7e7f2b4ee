//! Test specification parser.
//!
//! Extracts per-question test specs from assignment markup. Two markup
//! conventions are understood:
//!
//! - **legacy**: one `textarea.code` per question; a `### Test` heading inside
//!   it separates the answer skeleton from the test code that follows.
//! - **structured**: after each answer region, sibling elements tagged
//!   `testcases`, `testcode` or `runtemplate` up to the next `h1`/`h2`.
//!
//! Problem-config assignments carry their spec in a JSON document next to the
//! assignment page instead (see [`problem_config_url`]).

use autograder_common::error::SpecError;
use autograder_common::types::{ProblemCase, TestCase, TestSpec};
use lazy_static::lazy_static;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use tracing::{debug, warn};

pub const CASE_SEPARATOR: &str = "=====";
pub const IO_SEPARATOR: &str = "]]]";

const ANSWER_SELECTOR: &str = "textarea.code";
const TAGGED_SELECTOR: &str = ".testcases, .testcode, .runtemplate";
const QUESTION_HEADINGS: [&str; 2] = ["h1", "h2"];

lazy_static! {
    static ref TEST_HEADING: Regex = Regex::new(r"(?m)^### Test").unwrap();
    static ref PROBLEM_URL: Regex = Regex::new(r"^(.*)[?]p=(.+)$").unwrap();
}

/// Decode the delimited testcases format: `in1]]]out1=====in2]]]out2`.
///
/// A literal `\n` inside either half becomes a newline; both halves are
/// trimmed after unescaping. Blank segments are skipped.
pub fn parse_testcases(blob: &str) -> Result<Vec<TestCase>, SpecError> {
    let mut cases = Vec::new();
    for (position, segment) in blob.split(CASE_SEPARATOR).enumerate() {
        if segment.trim().is_empty() {
            continue;
        }
        let (input, output) = segment
            .split_once(IO_SEPARATOR)
            .ok_or(SpecError::MissingSeparator { position })?;
        cases.push(TestCase::new(unescape(input), unescape(output)));
    }
    Ok(cases)
}

/// Encode cases in the delimited testcases format.
pub fn encode_testcases(cases: &[TestCase]) -> String {
    cases
        .iter()
        .map(|case| format!("{}{}{}", escape(&case.input), IO_SEPARATOR, escape(&case.expected_output)))
        .collect::<Vec<_>>()
        .join(CASE_SEPARATOR)
}

fn unescape(half: &str) -> String {
    half.replace("\\n", "\n").trim().to_string()
}

fn escape(half: &str) -> String {
    half.replace('\n', "\\n")
}

/// Split legacy question code at the test heading into (skeleton, tests).
pub fn split_at_test_heading(code: &str) -> (&str, &str) {
    match TEST_HEADING.find(code) {
        Some(m) => (&code[..m.start()], &code[m.start()..]),
        None => (code, ""),
    }
}

/// Drop anything a student pasted from the test heading onward.
pub fn strip_embedded_tests(answer: &str) -> &str {
    split_at_test_heading(answer).0
}

/// Everything declared for one question
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuestionSpec {
    pub language: Option<String>,
    pub file_name: Option<String>,
    pub testcode: Option<String>,
    pub testcases: Option<Vec<TestCase>>,
    pub run_template: Option<String>,
}

impl QuestionSpec {
    /// The spec this question is graded with, testcode first.
    /// `None` when neither testcode nor testcases were declared.
    pub fn test_spec(&self) -> Option<TestSpec> {
        if let Some(template) = &self.testcode {
            return Some(TestSpec::Code {
                template: template.clone(),
            });
        }
        self.testcases.as_ref().map(|cases| TestSpec::Cases {
            cases: cases.clone(),
            run_template: self.run_template.clone(),
        })
    }
}

/// Spec chosen for a question plus the answer-region tags
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSpec {
    pub spec: TestSpec,
    pub language: Option<String>,
    pub file_name: Option<String>,
}

/// All specs of one assignment, cached by the grading loop
#[derive(Debug, Clone, Default)]
pub struct AssignmentSpecs {
    questions: Vec<QuestionSpec>,
    problem: Option<TestSpec>,
}

impl AssignmentSpecs {
    pub fn from_problem(problem: TestSpec) -> Self {
        Self {
            questions: Vec::new(),
            problem: Some(problem),
        }
    }

    pub fn parse_markup(html: &str) -> Self {
        let document = Html::parse_document(html);
        let tagged = selector(TAGGED_SELECTOR);

        let questions = if document.select(&tagged).next().is_some() {
            parse_structured(&document)
        } else {
            parse_legacy(&document)
        };

        debug!(questions = questions.len(), "Parsed assignment markup");
        Self {
            questions,
            problem: None,
        }
    }

    pub fn questions(&self) -> &[QuestionSpec] {
        &self.questions
    }

    pub fn question(&self, index: usize) -> Result<&QuestionSpec, SpecError> {
        self.questions.get(index).ok_or(SpecError::QuestionOutOfRange {
            index,
            available: self.questions.len(),
        })
    }

    /// Pick the spec for a question, falling back to the problem config and
    /// finally to the empty spec.
    pub fn resolve(&self, index: usize) -> ResolvedSpec {
        let question = match self.question(index) {
            Ok(question) => Some(question),
            Err(e) => {
                if self.problem.is_none() {
                    warn!(error = %e, "No spec for question; grading with empty spec");
                }
                None
            }
        };

        let spec = question
            .and_then(QuestionSpec::test_spec)
            .or_else(|| self.problem.clone())
            .unwrap_or_else(TestSpec::empty);

        ResolvedSpec {
            spec,
            language: question.and_then(|q| q.language.clone()),
            file_name: question.and_then(|q| q.file_name.clone()),
        }
    }
}

fn selector(css: &str) -> Selector {
    Selector::parse(css).unwrap()
}

fn parse_legacy(document: &Html) -> Vec<QuestionSpec> {
    document
        .select(&selector(ANSWER_SELECTOR))
        .map(|region| {
            let code: String = region.text().collect();
            let (_, tests) = split_at_test_heading(&code);
            QuestionSpec {
                language: attr(region, "data-language"),
                file_name: attr(region, "data-filename"),
                testcode: (!tests.is_empty()).then(|| tests.to_string()),
                ..Default::default()
            }
        })
        .collect()
}

fn parse_structured(document: &Html) -> Vec<QuestionSpec> {
    let answers: Vec<ElementRef<'_>> = document.select(&selector(ANSWER_SELECTOR)).collect();

    if answers.is_empty() {
        // No answer regions: every tagged test region is its own question.
        return document
            .select(&selector(".testcases, .testcode"))
            .map(|region| {
                let mut question = QuestionSpec::default();
                absorb(region, &mut question);
                question
            })
            .collect();
    }

    answers
        .into_iter()
        .map(|answer| {
            let mut question = QuestionSpec {
                language: attr(answer, "data-language"),
                file_name: attr(answer, "data-filename"),
                ..Default::default()
            };
            collect_siblings(answer, &mut question);
            question
        })
        .collect()
}

fn collect_siblings(answer: ElementRef<'_>, question: &mut QuestionSpec) {
    let tagged = selector(TAGGED_SELECTOR);

    for node in answer.next_siblings() {
        let Some(element) = ElementRef::wrap(node) else {
            continue;
        };
        let name = element.value().name();
        if QUESTION_HEADINGS.contains(&name) || is_answer_region(element) {
            break;
        }
        if is_tagged(element) {
            absorb(element, question);
        } else {
            for nested in element.select(&tagged) {
                absorb(nested, question);
            }
        }
    }
}

fn is_answer_region(element: ElementRef<'_>) -> bool {
    element.value().name() == "textarea" && has_class(element, "code")
}

fn is_tagged(element: ElementRef<'_>) -> bool {
    ["testcases", "testcode", "runtemplate"]
        .iter()
        .any(|class| has_class(element, class))
}

fn has_class(element: ElementRef<'_>, class: &str) -> bool {
    element.value().classes().any(|c| c == class)
}

fn attr(element: ElementRef<'_>, name: &str) -> Option<String> {
    element
        .value()
        .attr(name)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn absorb(element: ElementRef<'_>, question: &mut QuestionSpec) {
    let text: String = element.text().collect();

    if has_class(element, "testcode") {
        question.testcode = Some(text);
    } else if has_class(element, "testcases") {
        match parse_testcases(&text) {
            Ok(cases) => question.testcases = Some(cases),
            Err(e) => warn!(error = %e, "Malformed testcases region; treating as empty spec"),
        }
    } else if has_class(element, "runtemplate") {
        question.run_template = Some(text);
    }
}

#[derive(Debug, Default, Deserialize)]
struct ProblemConfig {
    #[serde(default)]
    stage: StageSection,
    #[serde(default)]
    problem: ProblemSection,
}

#[derive(Debug, Default, Deserialize)]
struct StageSection {
    #[serde(rename = "type", default)]
    stage_type: Option<String>,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
struct ProblemSection {
    #[serde(rename = "testCases", default)]
    test_cases: Option<Vec<ProblemCase>>,
}

/// `{prefix}?p={id}` → `{prefix}problems/{id}.json`
pub fn problem_config_url(assignment_url: &str) -> Result<String, SpecError> {
    let captures = PROBLEM_URL
        .captures(assignment_url)
        .ok_or_else(|| SpecError::NoProblemId(assignment_url.to_string()))?;
    Ok(format!("{}problems/{}.json", &captures[1], &captures[2]))
}

pub fn parse_problem_config(json: &str) -> Result<TestSpec, SpecError> {
    let config: ProblemConfig =
        serde_json::from_str(json).map_err(|e| SpecError::InvalidProblem(e.to_string()))?;

    Ok(TestSpec::Problem {
        stage_type: config.stage.stage_type,
        stage_data: config.stage.data,
        test_cases: config.problem.test_cases,
    })
}

//! Grading Loop - High-Level Orchestration
//!
//! **Responsibility:**
//! List pending submissions, grade each one, push scores back in batches.
//!
//! **Architecture:**
//! 1. Fetch and cache parsed assignment specs (spec.rs)
//! 2. Resolve a runner per question (runner.rs)
//! 3. Runner composes, executes and evaluates (harness.rs, engine.rs, evaluator.rs)
//! 4. Push `ScoreUpdate` batches to the grading store
//!
//! Submissions are graded one at a time. A fetch failure aborts only its
//! assignment; an unreachable sandbox or a refused push ends the pass.

use crate::runner::RunnerRegistry;
use crate::spec::{parse_problem_config, problem_config_url, AssignmentSpecs};
use autograder_common::classroom::{AssignmentSource, GradingStore};
use autograder_common::error::GradeError;
use autograder_common::types::{Outcome, ScoreUpdate, Submission};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Counters for one grading pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassSummary {
    pub assignments: usize,
    pub graded: usize,
    /// Already scored and not regraded
    pub skipped_scored: usize,
    /// No runner supports the question's spec; left ungraded
    pub skipped_unconfigured: usize,
    pub failed_assignments: usize,
    pub pushed: usize,
}

pub struct GradingLoop {
    registry: RunnerRegistry,
    source: Arc<dyn AssignmentSource>,
    store: Arc<dyn GradingStore>,
    batch_size: usize,
    overwrite: bool,
    cache: HashMap<String, Arc<AssignmentSpecs>>,
}

impl GradingLoop {
    pub fn new(
        registry: RunnerRegistry,
        source: Arc<dyn AssignmentSource>,
        store: Arc<dyn GradingStore>,
        batch_size: usize,
        overwrite: bool,
    ) -> Self {
        Self {
            registry,
            source,
            store,
            batch_size: batch_size.max(1),
            overwrite,
            cache: HashMap::new(),
        }
    }

    /// Parsed specs for an assignment, fetched at most once per process
    pub async fn load_specs(&mut self, assignment_url: &str) -> Result<Arc<AssignmentSpecs>, GradeError> {
        if let Some(specs) = self.cache.get(assignment_url) {
            return Ok(specs.clone());
        }

        let specs = match problem_config_url(assignment_url) {
            Ok(config_url) => {
                debug!(url = %config_url, "Fetching problem config");
                let json = self.source.fetch_text(&config_url).await?;
                let problem = parse_problem_config(&json).map_err(|e| GradeError::fetch(&config_url, e))?;
                AssignmentSpecs::from_problem(problem)
            }
            Err(_) => {
                debug!(url = %assignment_url, "Fetching assignment markup");
                let html = self.source.fetch_text(assignment_url).await?;
                AssignmentSpecs::parse_markup(&html)
            }
        };

        let specs = Arc::new(specs);
        self.cache.insert(assignment_url.to_string(), specs.clone());
        Ok(specs)
    }

    /// Grade one submission against its question's spec
    pub async fn grade_submission(&self, specs: &AssignmentSpecs, submission: &Submission) -> Result<Outcome, GradeError> {
        let resolved = specs.resolve(submission.question_index);
        let language = resolved.language.as_deref().or(submission.language.as_deref());
        let runner = self.registry.resolve(language, &resolved.spec)?;

        debug!(
            submission_id = submission.id,
            question_index = submission.question_index,
            kind = %resolved.spec.kind(),
            runner = %runner.language(),
            "Grading submission"
        );

        let outcome = runner
            .evaluate(&resolved.spec, &submission.answer_source, resolved.file_name.as_deref())
            .await?;
        Ok(outcome)
    }

    async fn flush(&self, pending: &mut Vec<ScoreUpdate>, summary: &mut PassSummary) -> Result<(), GradeError> {
        if pending.is_empty() {
            return Ok(());
        }
        self.store.push_scores(pending).await?;
        info!(count = pending.len(), "Pushed score batch");
        summary.pushed += pending.len();
        pending.clear();
        Ok(())
    }

    /// One full pass over every assignment with pending submissions
    #[instrument(skip(self), fields(batch_size = self.batch_size, overwrite = self.overwrite))]
    pub async fn run_pass(&mut self) -> Result<PassSummary, GradeError> {
        let assignments = self.store.pending_assignments().await?;
        let mut summary = PassSummary {
            assignments: assignments.len(),
            ..Default::default()
        };
        let mut pending: Vec<ScoreUpdate> = Vec::new();

        info!(assignments = assignments.len(), "Starting grading pass");

        for assignment in &assignments {
            let (to_grade, scored): (Vec<&Submission>, Vec<&Submission>) = assignment
                .submissions
                .iter()
                .partition(|submission| self.overwrite || submission.current_score.is_none());
            summary.skipped_scored += scored.len();

            if to_grade.is_empty() {
                continue;
            }

            let specs = match self.load_specs(&assignment.assignment_url).await {
                Ok(specs) => specs,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(url = %assignment.assignment_url, error = %e, "Skipping assignment");
                    summary.failed_assignments += 1;
                    continue;
                }
            };

            for submission in to_grade {
                match self.grade_submission(&specs, submission).await {
                    Ok(outcome) => {
                        info!(
                            submission_id = submission.id,
                            username = %submission.username,
                            question_index = submission.question_index,
                            success = outcome.success,
                            score = outcome.score,
                            "Submission graded"
                        );
                        pending.push(ScoreUpdate::from_outcome(submission.id, &outcome));
                        summary.graded += 1;
                    }
                    Err(e) if e.is_fatal() => {
                        error!(submission_id = submission.id, error = %e, "Grading pass aborted");
                        if let Err(push_error) = self.flush(&mut pending, &mut summary).await {
                            error!(error = %push_error, "Failed to push scores graded before abort");
                        }
                        return Err(e);
                    }
                    Err(e) => {
                        error!(submission_id = submission.id, error = %e, "Submission left ungraded");
                        summary.skipped_unconfigured += 1;
                    }
                }

                if pending.len() >= self.batch_size {
                    self.flush(&mut pending, &mut summary).await?;
                }
            }
        }

        self.flush(&mut pending, &mut summary).await?;

        info!(
            graded = summary.graded,
            pushed = summary.pushed,
            skipped_scored = summary.skipped_scored,
            failed_assignments = summary.failed_assignments,
            "Grading pass complete"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::tests::{registry_with, ScriptedSandbox};
    use async_trait::async_trait;
    use autograder_common::error::SandboxError;
    use autograder_common::types::{AssignmentSubmissions, ExecutionResult};
    use std::sync::Mutex;

    const SOMA_URL: &str = "http://classroom.local/listas/soma.html";
    const SOMA_HTML: &str = r#"
        <h2>Soma</h2>
        <textarea class="code" data-language="python"></textarea>
        <pre class="testcases">3\n4]]]7</pre>
    "#;

    #[derive(Default)]
    struct FakeSource {
        pages: HashMap<String, String>,
        fetched: Mutex<Vec<String>>,
    }

    impl FakeSource {
        fn with(pages: &[(&str, &str)]) -> Self {
            Self {
                pages: pages.iter().map(|(u, b)| (u.to_string(), b.to_string())).collect(),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl AssignmentSource for FakeSource {
        async fn fetch_text(&self, url: &str) -> Result<String, GradeError> {
            self.fetched.lock().unwrap().push(url.to_string());
            self.pages
                .get(url)
                .cloned()
                .ok_or_else(|| GradeError::fetch(url, "404 Not Found"))
        }
    }

    #[derive(Default)]
    struct FakeStore {
        assignments: Vec<AssignmentSubmissions>,
        pushed: Mutex<Vec<Vec<ScoreUpdate>>>,
        refuse_pushes: bool,
    }

    #[async_trait]
    impl GradingStore for FakeStore {
        async fn pending_assignments(&self) -> Result<Vec<AssignmentSubmissions>, GradeError> {
            Ok(self.assignments.clone())
        }

        async fn push_scores(&self, batch: &[ScoreUpdate]) -> Result<(), GradeError> {
            if self.refuse_pushes {
                return Err(GradeError::Store {
                    message: "500 Internal Server Error".to_string(),
                });
            }
            self.pushed.lock().unwrap().push(batch.to_vec());
            Ok(())
        }
    }

    fn submission(id: i64, answer: &str, score: Option<f64>) -> Submission {
        Submission {
            id,
            username: format!("aluno{}", id),
            question_index: 0,
            answer_source: answer.to_string(),
            language: None,
            current_score: score,
        }
    }

    fn assignment(url: &str, submissions: Vec<Submission>) -> AssignmentSubmissions {
        AssignmentSubmissions {
            assignment_url: url.to_string(),
            submissions,
        }
    }

    fn grading_loop(
        sandbox: Arc<ScriptedSandbox>,
        source: Arc<FakeSource>,
        store: Arc<FakeStore>,
        batch_size: usize,
        overwrite: bool,
    ) -> GradingLoop {
        GradingLoop::new(registry_with(sandbox), source, store, batch_size, overwrite)
    }

    #[tokio::test]
    async fn test_grades_and_pushes_scores() {
        let sandbox = Arc::new(ScriptedSandbox::replying(&["7\n", "8\n"]));
        let source = Arc::new(FakeSource::with(&[(SOMA_URL, SOMA_HTML)]));
        let store = Arc::new(FakeStore {
            assignments: vec![assignment(
                SOMA_URL,
                vec![
                    submission(1, "print(int(input()) + int(input()))", None),
                    submission(2, "print(8)", None),
                ],
            )],
            ..Default::default()
        });

        let mut grader = grading_loop(sandbox.clone(), source.clone(), store.clone(), 30, false);
        let summary = grader.run_pass().await.unwrap();

        assert_eq!(summary.graded, 2);
        assert_eq!(summary.pushed, 2);

        let pushed = store.pushed.lock().unwrap().clone();
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0][0].id, 1);
        assert_eq!(pushed[0][0].score, 1.0);
        assert_eq!(pushed[0][0].score_output, "1/1");
        assert_eq!(pushed[0][1].score, 0.0);

        // Markup fetched once for both submissions
        assert_eq!(source.fetched.lock().unwrap().len(), 1);
        assert_eq!(sandbox.requests()[0].stdin, "3\n4");
    }

    #[tokio::test]
    async fn test_scored_submissions_skipped_unless_overwrite() {
        let source = Arc::new(FakeSource::with(&[(SOMA_URL, SOMA_HTML)]));
        let store = Arc::new(FakeStore {
            assignments: vec![assignment(
                SOMA_URL,
                vec![submission(1, "print(7)", Some(1.0)), submission(2, "print(7)", None)],
            )],
            ..Default::default()
        });

        let sandbox = Arc::new(ScriptedSandbox::replying(&["7"]));
        let mut grader = grading_loop(sandbox, source.clone(), store.clone(), 30, false);
        let summary = grader.run_pass().await.unwrap();
        assert_eq!(summary.graded, 1);
        assert_eq!(summary.skipped_scored, 1);

        let sandbox = Arc::new(ScriptedSandbox::replying(&["7", "7"]));
        let mut grader = grading_loop(sandbox, source, store, 30, true);
        let summary = grader.run_pass().await.unwrap();
        assert_eq!(summary.graded, 2);
        assert_eq!(summary.skipped_scored, 0);
    }

    #[tokio::test]
    async fn test_scores_pushed_in_batches() {
        let source = Arc::new(FakeSource::with(&[(SOMA_URL, SOMA_HTML)]));
        let store = Arc::new(FakeStore {
            assignments: vec![assignment(
                SOMA_URL,
                (1..=5).map(|id| submission(id, "print(7)", None)).collect(),
            )],
            ..Default::default()
        });

        let mut grader = grading_loop(Arc::new(ScriptedSandbox::default()), source, store.clone(), 2, false);
        let summary = grader.run_pass().await.unwrap();

        let sizes: Vec<usize> = store.pushed.lock().unwrap().iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(summary.pushed, 5);
    }

    #[tokio::test]
    async fn test_fetch_failure_skips_only_that_assignment() {
        let source = Arc::new(FakeSource::with(&[(SOMA_URL, SOMA_HTML)]));
        let store = Arc::new(FakeStore {
            assignments: vec![
                assignment("http://classroom.local/listas/sumiu.html", vec![submission(1, "x", None)]),
                assignment(SOMA_URL, vec![submission(2, "print(7)", None)]),
            ],
            ..Default::default()
        });

        let sandbox = Arc::new(ScriptedSandbox::replying(&["7"]));
        let mut grader = grading_loop(sandbox, source, store.clone(), 30, false);
        let summary = grader.run_pass().await.unwrap();

        assert_eq!(summary.failed_assignments, 1);
        assert_eq!(summary.graded, 1);
        assert_eq!(store.pushed.lock().unwrap()[0][0].id, 2);
    }

    #[tokio::test]
    async fn test_problem_url_fetches_config() {
        let url = "http://classroom.local/blocomp/?p=limpeza";
        let config = r#"{"stage": {"type": "cleaning", "data": {}}, "problem": {}}"#;
        let source = Arc::new(FakeSource::with(&[(
            "http://classroom.local/blocomp/problems/limpeza.json",
            config,
        )]));
        let store = Arc::new(FakeStore {
            assignments: vec![assignment(url, vec![submission(9, r#"{"code": {"javascript": ""}}"#, None)])],
            ..Default::default()
        });

        let sandbox = Arc::new(ScriptedSandbox::replying(&["\n{\"successful\": true}"]));
        let mut grader = grading_loop(sandbox.clone(), source, store.clone(), 30, false);
        grader.run_pass().await.unwrap();

        let pushed = store.pushed.lock().unwrap().clone();
        assert_eq!(pushed[0][0].score, 1.0);
        assert_eq!(sandbox.requests()[0].file_name, "code.js");
    }

    #[tokio::test]
    async fn test_empty_spec_grades_as_vacuous_testcode() {
        let url = "http://classroom.local/listas/sem-testes.html";
        let source = Arc::new(FakeSource::with(&[(url, "<p>Sem perguntas</p>")]));
        let store = Arc::new(FakeStore {
            assignments: vec![assignment(url, vec![submission(3, "print('oi')", None)])],
            ..Default::default()
        });

        let mut grader = grading_loop(Arc::new(ScriptedSandbox::default()), source, store.clone(), 30, false);
        grader.run_pass().await.unwrap();

        assert_eq!(store.pushed.lock().unwrap()[0][0].score, 1.0);
    }

    #[tokio::test]
    async fn test_unavailable_sandbox_aborts_after_flushing() {
        let sandbox = Arc::new(ScriptedSandbox::replying(&["7"]));
        sandbox
            .outputs
            .lock()
            .unwrap()
            .push(Err(SandboxError::unavailable("docker daemon unreachable")));
        let source = Arc::new(FakeSource::with(&[(SOMA_URL, SOMA_HTML)]));
        let store = Arc::new(FakeStore {
            assignments: vec![assignment(
                SOMA_URL,
                vec![
                    submission(1, "print(7)", None),
                    submission(2, "print(7)", None),
                    submission(3, "print(7)", None),
                ],
            )],
            ..Default::default()
        });

        let mut grader = grading_loop(sandbox, source, store.clone(), 30, false);
        let err = grader.run_pass().await.unwrap_err();

        assert!(err.is_fatal());
        let pushed = store.pushed.lock().unwrap().clone();
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0].len(), 1);
        assert_eq!(pushed[0][0].id, 1);
    }

    #[tokio::test]
    async fn test_store_refusal_is_fatal() {
        let source = Arc::new(FakeSource::with(&[(SOMA_URL, SOMA_HTML)]));
        let store = Arc::new(FakeStore {
            assignments: vec![assignment(SOMA_URL, vec![submission(1, "print(7)", None)])],
            refuse_pushes: true,
            ..Default::default()
        });

        let mut grader = grading_loop(Arc::new(ScriptedSandbox::default()), source, store, 30, false);
        let err = grader.run_pass().await.unwrap_err();
        assert!(matches!(err, GradeError::Store { .. }));
    }

    #[tokio::test]
    async fn test_grade_submission_timeout_is_failure() {
        let sandbox = Arc::new(ScriptedSandbox::default());
        sandbox.outputs.lock().unwrap().push(Ok(ExecutionResult {
            exit_code: None,
            output: String::new(),
            timed_out: true,
        }));
        let source = Arc::new(FakeSource::with(&[(SOMA_URL, SOMA_HTML)]));
        let mut grader = grading_loop(sandbox, source, Arc::new(FakeStore::default()), 30, false);

        let specs = grader.load_specs(SOMA_URL).await.unwrap();
        let outcome = grader
            .grade_submission(&specs, &submission(1, "while True: pass", None))
            .await
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.score, 0.0);
    }
}

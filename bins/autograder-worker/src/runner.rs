// Language runners and the registry that picks one per question.
//
// A runner bundles compositor, sandbox and evaluator for one language; the
// registry maps a declared language (or stage type) to a runner.

use crate::config::{LanguageConfig, LanguageConfigManager, RunnerFamily};
use crate::docker::{ContainerSpec, DockerRuntime};
use crate::engine::{ContainerSandbox, ProcessSandbox, Sandbox};
use crate::evaluator;
use crate::harness::{compose_problem, compose_run_template, stage_model, text_harness, TextHarness};
use async_trait::async_trait;
use autograder_common::config::SandboxStrategy;
use autograder_common::error::{GradeError, SandboxError};
use autograder_common::types::{ExecutionRequest, ExecutionResult, Outcome, ProblemCase, SpecKind, TestSpec};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Runner used when a question declares no language or an unknown one
pub const DEFAULT_LANGUAGE: &str = "python";

#[async_trait]
pub trait LanguageRunner: Send + Sync {
    fn language(&self) -> &str;

    fn supports(&self, kind: SpecKind) -> bool;

    /// Grade `answer` against `spec`. Only an unreachable sandbox is an error.
    async fn evaluate(&self, spec: &TestSpec, answer: &str, file_name: Option<&str>) -> Result<Outcome, SandboxError>;
}

/// Run once, turning oversized requests into a failed run
async fn run_once(sandbox: &dyn Sandbox, request: ExecutionRequest) -> Result<ExecutionResult, SandboxError> {
    match sandbox.execute(&request).await {
        Ok(result) => Ok(result),
        Err(e @ SandboxError::TooLarge { .. }) => {
            warn!(error = %e, "Request rejected before execution");
            Ok(ExecutionResult {
                exit_code: None,
                output: e.to_string(),
                timed_out: false,
            })
        }
        Err(e) => Err(e),
    }
}

fn unsupported(language: &str, spec: &TestSpec) -> Outcome {
    warn!(language = %language, kind = %spec.kind(), "Runner asked to grade a spec it does not support");
    Outcome::fail(format!("{} runner cannot grade {} specs", language, spec.kind()))
}

/// Line-oriented text languages: testcode and testcases specs
pub struct TextRunner {
    config: LanguageConfig,
    harness: TextHarness,
    sandbox: Arc<dyn Sandbox>,
}

impl TextRunner {
    pub fn new(config: LanguageConfig, sandbox: Arc<dyn Sandbox>) -> Self {
        let harness = text_harness(&config.name);
        Self {
            config,
            harness,
            sandbox,
        }
    }

    fn request(&self, source: String, stdin: &str, file_name: Option<&str>) -> ExecutionRequest {
        ExecutionRequest {
            source,
            stdin: stdin.to_string(),
            timeout_seconds: self.config.timeout_seconds,
            file_name: file_name.unwrap_or(&self.config.execution.file_name).to_string(),
        }
    }
}

#[async_trait]
impl LanguageRunner for TextRunner {
    fn language(&self) -> &str {
        &self.config.name
    }

    fn supports(&self, kind: SpecKind) -> bool {
        matches!(kind, SpecKind::Code | SpecKind::Cases)
    }

    async fn evaluate(&self, spec: &TestSpec, answer: &str, file_name: Option<&str>) -> Result<Outcome, SandboxError> {
        match spec {
            TestSpec::Code { template } => {
                let source = self.harness.compose_testcode(template, answer);
                let result = run_once(self.sandbox.as_ref(), self.request(source, "", file_name)).await?;
                Ok(evaluator::evaluate_testcode(&result))
            }
            TestSpec::Cases { cases, run_template } => {
                let source = compose_run_template(run_template.as_deref(), answer);
                let mut results = Vec::with_capacity(cases.len());
                for (position, case) in cases.iter().enumerate() {
                    debug!(case = position + 1, total = cases.len(), "Running test case");
                    let request = self.request(source.clone(), &case.input, file_name);
                    results.push(run_once(self.sandbox.as_ref(), request).await?);
                }
                Ok(evaluator::evaluate_testcases(cases, &results))
            }
            TestSpec::Problem { .. } => Ok(unsupported(&self.config.name, spec)),
        }
    }
}

/// Problem-config programs, optionally driving a stage model
pub struct ProblemRunner {
    config: LanguageConfig,
    sandbox: Arc<dyn Sandbox>,
}

impl ProblemRunner {
    pub fn new(config: LanguageConfig, sandbox: Arc<dyn Sandbox>) -> Self {
        Self { config, sandbox }
    }
}

#[async_trait]
impl LanguageRunner for ProblemRunner {
    fn language(&self) -> &str {
        &self.config.name
    }

    fn supports(&self, kind: SpecKind) -> bool {
        kind == SpecKind::Problem
    }

    async fn evaluate(&self, spec: &TestSpec, answer: &str, file_name: Option<&str>) -> Result<Outcome, SandboxError> {
        let (stage_type, stage_data, test_cases) = match spec {
            TestSpec::Problem {
                stage_type,
                stage_data,
                test_cases,
            } => (stage_type.as_deref(), stage_data, test_cases),
            _ => return Ok(unsupported(&self.config.name, spec)),
        };

        let has_model = stage_model(stage_type).is_some();
        if stage_type.is_some() && !has_model {
            warn!(stage_type = ?stage_type, "Unknown stage type, comparing plain output");
        }

        let default_cases = vec![ProblemCase::default()];
        let cases = match test_cases {
            Some(cases) if !cases.is_empty() => cases,
            _ => &default_cases,
        };

        let mut outcomes = Vec::with_capacity(cases.len());
        for case in cases {
            let data = case.data.as_ref().unwrap_or(stage_data);
            let request = ExecutionRequest {
                source: compose_problem(answer, stage_type, data),
                // Always one line, so `prompt()` on an empty input yields "" rather than null
                stdin: format!("{}\n", case.input),
                timeout_seconds: self.config.timeout_seconds,
                file_name: file_name.unwrap_or(&self.config.execution.file_name).to_string(),
            };
            let result = run_once(self.sandbox.as_ref(), request).await?;
            outcomes.push(evaluator::evaluate_problem_case(&result, case.output.as_deref(), has_model));
        }

        Ok(evaluator::tally_problem_cases(&outcomes))
    }
}

struct RegisteredRunner {
    config: LanguageConfig,
    runner: Arc<dyn LanguageRunner>,
}

/// Language → runner mapping, resolved once per question
#[derive(Default)]
pub struct RunnerRegistry {
    runners: Vec<RegisteredRunner>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, config: LanguageConfig, runner: Arc<dyn LanguageRunner>) {
        self.runners.push(RegisteredRunner { config, runner });
    }

    /// One runner and sandbox per configured language
    pub fn from_config(
        manager: &LanguageConfigManager,
        strategy: SandboxStrategy,
        scratch_root: &Path,
    ) -> Result<Self, SandboxError> {
        let docker = match strategy {
            SandboxStrategy::Container => Some(Arc::new(DockerRuntime::connect()?)),
            SandboxStrategy::Process => None,
        };

        let mut registry = Self::new();
        for name in manager.list_languages() {
            let config = manager
                .get_config(&name)
                .map_err(|e| SandboxError::unavailable(e.to_string()))?
                .clone();

            let sandbox: Arc<dyn Sandbox> = match &docker {
                Some(runtime) => Arc::new(ContainerSandbox::new(
                    runtime.clone(),
                    ContainerSpec::for_language(&config, scratch_root),
                    config.execution.clone(),
                )),
                None => Arc::new(ProcessSandbox::new(config.execution.clone())),
            };

            let runner: Arc<dyn LanguageRunner> = match config.family {
                RunnerFamily::Text => Arc::new(TextRunner::new(config.clone(), sandbox)),
                RunnerFamily::Problem => Arc::new(ProblemRunner::new(config.clone(), sandbox)),
            };

            info!(language = %config.name, family = ?config.family, sandbox = ?strategy, "Registered runner");
            registry.register(config, runner);
        }
        Ok(registry)
    }

    pub fn languages(&self) -> Vec<&str> {
        self.runners.iter().map(|entry| entry.config.name.as_str()).collect()
    }

    /// Pick the runner for a question.
    ///
    /// Declared language first, then stage type for problem specs, then the
    /// default language, then any runner supporting the spec kind.
    pub fn resolve(&self, language: Option<&str>, spec: &TestSpec) -> Result<Arc<dyn LanguageRunner>, GradeError> {
        let kind = spec.kind();
        let supporting = || self.runners.iter().filter(move |entry| entry.runner.supports(kind));

        if let Some(language) = language {
            if let Some(entry) = supporting().find(|entry| entry.config.answers_to(language)) {
                return Ok(entry.runner.clone());
            }
            debug!(language = %language, kind = %kind, "Declared language has no matching runner");
        }

        if let TestSpec::Problem {
            stage_type: Some(stage_type),
            ..
        } = spec
        {
            if let Some(entry) = supporting().find(|entry| entry.config.stage_types.iter().any(|t| t == stage_type)) {
                return Ok(entry.runner.clone());
            }
        }

        supporting()
            .find(|entry| entry.config.answers_to(DEFAULT_LANGUAGE))
            .or_else(|| supporting().next())
            .map(|entry| entry.runner.clone())
            .ok_or_else(|| GradeError::Configuration {
                kind,
                language: language.unwrap_or(DEFAULT_LANGUAGE).to_string(),
            })
    }
}

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use autograder_common::classroom::{AssignmentSource, ClassroomApi, GradingStore};
use autograder_common::config::{ClassroomSettings, SandboxStrategy, WorkerSettings};
use autograder_common::error::GradeError;
use autograder_common::types::{AssignmentSubmissions, ScoreUpdate, Submission};
use autograder_worker::config::LanguageConfigManager;
use autograder_worker::docker::{teardown, ContainerSpec, DockerRuntime};
use autograder_worker::executor::GradingLoop;
use autograder_worker::runner::RunnerRegistry;
use autograder_worker::spec::{parse_problem_config, AssignmentSpecs};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "autograder-worker")]
#[command(about = "Grades classroom submissions in sandboxed runs", long_about = None)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Sandbox strategy (process or container); overrides AUTOGRADER_SANDBOX
    #[arg(long, global = true)]
    sandbox: Option<SandboxStrategy>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Grade every pending submission of the configured classroom
    Run {
        /// Repeat the pass every N seconds until interrupted
        #[arg(long)]
        interval: Option<u64>,
    },

    /// Grade one answer against a local assignment file
    Grade {
        /// Assignment markup (.html) or problem config (.json)
        #[arg(short, long)]
        assignment: PathBuf,

        /// Zero-based question index
        #[arg(short, long, default_value = "0")]
        question: usize,

        /// File holding the answer source
        #[arg(long)]
        answer: PathBuf,

        /// Language override when the markup declares none
        #[arg(short, long)]
        language: Option<String>,
    },

    /// Stop and remove the warm containers of every configured language
    Teardown,

    /// List configured languages
    Languages,
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let mut settings = WorkerSettings::from_env()?;
    if let Some(sandbox) = cli.sandbox {
        settings.sandbox = sandbox;
    }

    let languages = LanguageConfigManager::load(&settings.languages_path).map_err(|e| {
        error!("Failed to load language configurations: {}", e);
        error!("Make sure {} exists", settings.languages_path.display());
        e
    })?;
    info!("Loaded language configurations for: {:?}", languages.list_languages());

    match cli.command {
        Commands::Run { interval } => run(&settings, &languages, interval).await,
        Commands::Grade {
            assignment,
            question,
            answer,
            language,
        } => grade_local(&settings, &languages, assignment, question, answer, language).await,
        Commands::Teardown => teardown_containers(&settings, &languages).await,
        Commands::Languages => {
            for name in languages.list_languages() {
                let config = languages.get_config(&name)?;
                println!("{:<12} {:<20} {:?}", config.name, config.image, config.family);
            }
            Ok(())
        }
    }
}

async fn run(settings: &WorkerSettings, languages: &LanguageConfigManager, interval: Option<u64>) -> Result<()> {
    let classroom = ClassroomSettings::from_env()?;
    info!("Autograder worker booting (classroom {})", classroom.classroom_id);

    let mut api = ClassroomApi::new(&classroom.api_base_path, &classroom.classroom_id);
    api.login(&classroom.username, &classroom.password).await?;
    let api = Arc::new(api);

    let registry = RunnerRegistry::from_config(languages, settings.sandbox, &settings.scratch_root)?;
    let mut grader = GradingLoop::new(registry, api.clone(), api, settings.batch_size, settings.overwrite);

    let Some(seconds) = interval else {
        let summary = grader.run_pass().await?;
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    };

    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
        warn!("Received shutdown signal, finishing...");
    };

    let passes = async {
        loop {
            if let Err(e) = grader.run_pass().await {
                break e;
            }
            tokio::time::sleep(Duration::from_secs(seconds)).await;
        }
    };

    tokio::select! {
        e = passes => return Err(e.into()),
        _ = shutdown => {},
    }

    info!("Worker shutdown complete");
    Ok(())
}

async fn grade_local(
    settings: &WorkerSettings,
    languages: &LanguageConfigManager,
    assignment: PathBuf,
    question: usize,
    answer: PathBuf,
    language: Option<String>,
) -> Result<()> {
    let content = tokio::fs::read_to_string(&assignment)
        .await
        .with_context(|| format!("Failed to read {}", assignment.display()))?;
    let answer_source = tokio::fs::read_to_string(&answer)
        .await
        .with_context(|| format!("Failed to read {}", answer.display()))?;

    let specs = match assignment.extension().and_then(|ext| ext.to_str()) {
        Some("json") => AssignmentSpecs::from_problem(parse_problem_config(&content)?),
        Some("html") | Some("htm") => AssignmentSpecs::parse_markup(&content),
        _ => bail!("Assignment must be an .html page or a .json problem config"),
    };

    let registry = RunnerRegistry::from_config(languages, settings.sandbox, &settings.scratch_root)?;
    let grader = GradingLoop::new(
        registry,
        Arc::new(NoRemote),
        Arc::new(NoRemote),
        settings.batch_size,
        true,
    );

    let submission = Submission {
        id: 0,
        username: "local".to_string(),
        question_index: question,
        answer_source,
        language,
        current_score: None,
    };

    let outcome = grader.grade_submission(&specs, &submission).await?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

async fn teardown_containers(settings: &WorkerSettings, languages: &LanguageConfigManager) -> Result<()> {
    let runtime = DockerRuntime::connect()?;
    for config in languages.configs() {
        let container = ContainerSpec::for_language(config, &settings.scratch_root);
        if teardown(&runtime, &container.name).await? {
            println!("removed {}", container.name);
        }
    }
    Ok(())
}

/// Stand-in for the classroom API when grading local files
struct NoRemote;

#[async_trait]
impl AssignmentSource for NoRemote {
    async fn fetch_text(&self, url: &str) -> Result<String, GradeError> {
        Err(GradeError::fetch(url, "no remote source in local mode"))
    }
}

#[async_trait]
impl GradingStore for NoRemote {
    async fn pending_assignments(&self) -> Result<Vec<AssignmentSubmissions>, GradeError> {
        Ok(Vec::new())
    }

    async fn push_scores(&self, _batch: &[ScoreUpdate]) -> Result<(), GradeError> {
        Ok(())
    }
}

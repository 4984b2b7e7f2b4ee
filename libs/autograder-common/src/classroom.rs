use crate::error::GradeError;
use crate::types::{AssignmentSubmissions, ScoreUpdate};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

/// Classroom API endpoint semantics. Paths are relative to the API base path
/// so the grader and the classroom backend never drift.
pub const LOGIN_PATH: &str = "login";
pub const SUBMISSIONS_PATH: &str = "submissions";

/// Path listing every assignment of a classroom with its submissions
pub fn classroom_submissions_path(classroom_id: &str) -> String {
    format!("classrooms/{}/submissions", classroom_id)
}

/// Where assignment markup and problem configs come from
#[async_trait]
pub trait AssignmentSource: Send + Sync {
    /// Fetch a document by absolute URL. Unreachable or non-2xx is a fetch error.
    async fn fetch_text(&self, url: &str) -> Result<String, GradeError>;
}

/// Where submissions come from and scores go to
#[async_trait]
pub trait GradingStore: Send + Sync {
    async fn pending_assignments(&self) -> Result<Vec<AssignmentSubmissions>, GradeError>;

    async fn push_scores(&self, batch: &[ScoreUpdate]) -> Result<(), GradeError>;
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    access_token: String,
}

/// HTTP client for the classroom backend
#[derive(Debug, Clone)]
pub struct ClassroomApi {
    client: reqwest::Client,
    base_url: String,
    classroom_id: String,
    token: Option<String>,
}

impl ClassroomApi {
    pub fn new(base_url: impl Into<String>, classroom_id: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        Self {
            client: reqwest::Client::new(),
            base_url,
            classroom_id: classroom_id.into(),
            token: None,
        }
    }

    /// Absolute URLs pass through, anything else is joined to the base path.
    pub fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}{}", self.base_url, path.trim_start_matches('/'))
        }
    }

    pub async fn login(&mut self, username: &str, password: &str) -> Result<(), GradeError> {
        let response = self
            .client
            .post(self.url(LOGIN_PATH))
            .json(&serde_json::json!({ "username": username, "password": password }))
            .send()
            .await
            .map_err(|e| GradeError::Store {
                message: format!("login request failed: {}", e),
            })?;

        if !response.status().is_success() {
            return Err(GradeError::Store {
                message: format!("authentication failed with status {}", response.status()),
            });
        }

        let body: LoginResponse = response.json().await.map_err(|e| GradeError::Store {
            message: format!("malformed login response: {}", e),
        })?;
        self.token = Some(body.access_token);

        info!(username = %username, "Authenticated with classroom API");
        Ok(())
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

#[async_trait]
impl AssignmentSource for ClassroomApi {
    async fn fetch_text(&self, url: &str) -> Result<String, GradeError> {
        let url = self.url(url);
        debug!(url = %url, "Fetching document");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| GradeError::fetch(&url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(GradeError::fetch(&url, format!("status {}", status)));
        }

        response.text().await.map_err(|e| GradeError::fetch(&url, e))
    }
}

#[async_trait]
impl GradingStore for ClassroomApi {
    async fn pending_assignments(&self) -> Result<Vec<AssignmentSubmissions>, GradeError> {
        let url = self.url(&classroom_submissions_path(&self.classroom_id));

        let response = self
            .authorized(self.client.get(&url))
            .send()
            .await
            .map_err(|e| GradeError::Store {
                message: format!("failed to list submissions: {}", e),
            })?;

        if !response.status().is_success() {
            return Err(GradeError::Store {
                message: format!("listing submissions returned status {}", response.status()),
            });
        }

        response.json().await.map_err(|e| GradeError::Store {
            message: format!("malformed submissions payload: {}", e),
        })
    }

    async fn push_scores(&self, batch: &[ScoreUpdate]) -> Result<(), GradeError> {
        if batch.is_empty() {
            return Ok(());
        }

        let response = self
            .authorized(self.client.put(self.url(SUBMISSIONS_PATH)))
            .json(batch)
            .send()
            .await
            .map_err(|e| GradeError::Store {
                message: format!("failed to push scores: {}", e),
            })?;

        if !response.status().is_success() {
            return Err(GradeError::Store {
                message: format!("score update returned status {}", response.status()),
            });
        }

        info!(count = batch.len(), "Pushed score batch");
        Ok(())
    }
}

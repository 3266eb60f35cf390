use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Name used in the overlay when the roster cannot be reached.
pub const PLACEHOLDER_NAME: &str = "Unknown Viewer";

/// Identity burned into the watermark.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentData {
    pub name: String,
    #[serde(default)]
    pub phone: String,
}

impl StudentData {
    pub fn placeholder() -> Self {
        Self {
            name: PLACEHOLDER_NAME.to_string(),
            phone: String::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RosterError {
    #[error("roster request timed out after {0:?}")]
    Timeout(Duration),

    #[error("roster request failed: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("roster responded with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid roster response: {0}")]
    Decode(String),
}

/// Source of the viewer identity for a given uploader.
#[async_trait]
pub trait StudentRoster: Send + Sync {
    async fn fetch(&self, teacher_id: i32) -> Result<StudentData, RosterError>;
}

/// Fixed roster used when no remote roster is configured.
#[derive(Debug, Clone)]
pub struct StaticRoster {
    data: StudentData,
}

impl StaticRoster {
    pub fn new(data: StudentData) -> Self {
        Self { data }
    }
}

impl Default for StaticRoster {
    fn default() -> Self {
        Self::new(StudentData {
            name: "Student Name".to_string(),
            phone: "1234567890".to_string(),
        })
    }
}

#[async_trait]
impl StudentRoster for StaticRoster {
    async fn fetch(&self, _teacher_id: i32) -> Result<StudentData, RosterError> {
        Ok(self.data.clone())
    }
}

/// Roster backed by the teacher's remote student system.
///
/// Calls `GET {base_url}/teachers/{id}/student` and expects `{"name", "phone"}`.
pub struct HttpRoster {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl HttpRoster {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl StudentRoster for HttpRoster {
    async fn fetch(&self, teacher_id: i32) -> Result<StudentData, RosterError> {
        let url = format!("{}/teachers/{}/student", self.base_url, teacher_id);

        let res = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RosterError::Timeout(self.timeout)
                } else {
                    RosterError::Transport(e)
                }
            })?;

        if !res.status().is_success() {
            let status = res.status().as_u16();
            let body = res.text().await.unwrap_or_default();
            return Err(RosterError::Status { status, body });
        }

        let data: StudentData = res.json().await.map_err(|e| {
            if e.is_timeout() {
                RosterError::Timeout(self.timeout)
            } else {
                RosterError::Decode(e.to_string())
            }
        })?;

        if data.name.trim().is_empty() {
            return Err(RosterError::Decode("empty student name".to_string()));
        }
        Ok(data)
    }
}

/// Fetch the overlay identity, falling back to the placeholder on any error.
///
/// A roster outage must never block an upload.
pub async fn fetch_or_placeholder(roster: &dyn StudentRoster, teacher_id: i32) -> StudentData {
    match roster.fetch(teacher_id).await {
        Ok(data) => data,
        Err(e) => {
            tracing::warn!(teacher_id, error = %e, "Roster unavailable, using placeholder overlay");
            metrics::counter!("secureteach_roster_fallbacks_total").increment(1);
            StudentData::placeholder()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn static_roster_returns_fixed_record() {
        let data = StaticRoster::default().fetch(7).await.expect("static fetch");
        assert_eq!(data.name, "Student Name");
        assert_eq!(data.phone, "1234567890");
    }

    #[tokio::test]
    async fn http_roster_decodes_student() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/teachers/42/student"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"name": "Ada", "phone": "555-0100"})),
            )
            .mount(&server)
            .await;

        let roster = HttpRoster::new(server.uri(), Duration::from_secs(2));
        let data = roster.fetch(42).await.expect("fetch");
        assert_eq!(
            data,
            StudentData {
                name: "Ada".to_string(),
                phone: "555-0100".to_string()
            }
        );
    }

    #[tokio::test]
    async fn http_roster_reports_upstream_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503).set_body_string("down"))
            .mount(&server)
            .await;

        let roster = HttpRoster::new(server.uri(), Duration::from_secs(2));
        let err = roster.fetch(1).await.expect_err("should fail");
        assert!(matches!(err, RosterError::Status { status: 503, .. }));
    }

    #[tokio::test]
    async fn http_roster_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"name": "Late", "phone": ""}))
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let roster = HttpRoster::new(server.uri(), Duration::from_millis(200));
        let started = std::time::Instant::now();
        let err = roster.fetch(1).await.expect_err("should time out");
        assert!(matches!(err, RosterError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn failure_degrades_to_placeholder() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let roster = HttpRoster::new(server.uri(), Duration::from_secs(2));
        let data = fetch_or_placeholder(&roster, 3).await;
        assert_eq!(data, StudentData::placeholder());
    }
}

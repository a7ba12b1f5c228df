//! Dialogue avec le serveur de contrôle
//!
//! - [`TaskSource`] : d'où vient le lot de tâches d'un cycle
//! - [`StatusSink`] : où partent les comptes rendus de promotion
//!
//! [`ControlPlane`] implémente les deux sur HTTP. [`SnapshotTaskSource`] et
//! [`LogSink`] servent hors connexion.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{FetchError, Result};
use crate::model::{EntryState, ScheduleEntry, FROM_DATE_FORMAT};
use crate::snapshot;
use crate::tasks::{PromoteTask, Task, TaskBatch};

/// Compte rendu d'une promotion immédiate
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CurrentReport {
    #[serde(flatten)]
    pub task: PromoteTask,
    pub status: bool,
    pub error: Option<String>,
}

/// Corps envoyé sur `/schedule`
///
/// Contrairement au snapshot, `status` et `error` y figurent toujours,
/// à `null` quand ils n'ont pas de valeur.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduleReport<'a> {
    pub display: &'a str,
    pub from_date: String,
    pub name: &'a str,
    pub digest: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_url: Option<&'a str>,
    pub state: EntryState,
    pub status: Option<bool>,
    pub error: Option<&'a str>,
}

impl<'a> From<&'a ScheduleEntry> for ScheduleReport<'a> {
    fn from(entry: &'a ScheduleEntry) -> Self {
        Self {
            display: &entry.display,
            from_date: entry.from_date.format(FROM_DATE_FORMAT).to_string(),
            name: &entry.name,
            digest: &entry.digest,
            source_url: entry.source_url.as_deref(),
            state: entry.state,
            status: entry.status,
            error: entry.error.as_deref(),
        }
    }
}

#[async_trait]
pub trait TaskSource: Send + Sync {
    async fn fetch_tasks(&self) -> Result<TaskBatch>;
}

/// Les comptes rendus ne sont jamais rejoués : un échec est seulement journalisé
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn report_schedule(&self, entry: &ScheduleEntry);
    async fn report_current(&self, report: &CurrentReport);
}

/// Client HTTP du serveur de contrôle
#[derive(Debug, Clone)]
pub struct ControlPlane {
    client: reqwest::Client,
    base_url: String,
    serial: String,
}

impl ControlPlane {
    pub fn new(base_url: &str, serial: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(FetchError::Transport)?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            serial: serial.to_string(),
        })
    }

    /// `<base>/device/{serial}`
    pub fn device_url(&self) -> String {
        format!("{}/device/{}", self.base_url, self.serial)
    }

    async fn post<T: Serialize + Sync>(&self, endpoint: &str, body: &T) {
        let url = format!("{}/{}", self.device_url(), endpoint);
        match self.client.post(&url).json(body).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(url = %url, "Status reported");
            }
            Ok(response) => {
                warn!(url = %url, "Status report rejected: HTTP {}", response.status());
            }
            Err(e) => warn!(url = %url, "Unable to report status: {}", e),
        }
    }
}

#[async_trait]
impl TaskSource for ControlPlane {
    async fn fetch_tasks(&self) -> Result<TaskBatch> {
        let url = self.device_url();
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(FetchError::Transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::RemoteError(status.as_u16()).into());
        }

        let body = response.text().await.map_err(FetchError::Transport)?;
        let batch = TaskBatch::from_body(&body);
        debug!(url = %url, "Received {} tasks", batch.len());
        Ok(batch)
    }
}

#[async_trait]
impl StatusSink for ControlPlane {
    async fn report_schedule(&self, entry: &ScheduleEntry) {
        self.post("schedule", &ScheduleReport::from(entry)).await;
    }

    async fn report_current(&self, report: &CurrentReport) {
        self.post("current", report).await;
    }
}

/// Relit le planning persisté : entrées `scheduled` ou `error`
#[derive(Debug, Clone)]
pub struct SnapshotTaskSource {
    path: PathBuf,
}

impl SnapshotTaskSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TaskSource for SnapshotTaskSource {
    async fn fetch_tasks(&self) -> Result<TaskBatch> {
        let Some(state) = snapshot::load(&self.path).await? else {
            debug!("No snapshot at {}, nothing to replay", self.path.display());
            return Ok(TaskBatch::default());
        };
        Ok(state
            .schedule
            .pending()
            .into_iter()
            .map(Task::Schedule)
            .collect())
    }
}

/// Puits de comptes rendus qui se contente de journaliser
#[derive(Debug, Clone, Default)]
pub struct LogSink;

#[async_trait]
impl StatusSink for LogSink {
    async fn report_schedule(&self, entry: &ScheduleEntry) {
        info!(
            display = %entry.display,
            "Schedule {} from {}: {} {}",
            entry.name,
            entry.from_date,
            entry.state.as_str(),
            entry.error.as_deref().unwrap_or("")
        );
    }

    async fn report_current(&self, report: &CurrentReport) {
        info!(
            "Current {} on {}: promoted={} {}",
            report.task.digest,
            report.task.display.as_deref().unwrap_or("*"),
            report.status,
            report.error.as_deref().unwrap_or("")
        );
    }
}

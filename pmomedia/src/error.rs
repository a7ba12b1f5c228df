//! Types d'erreurs pour pmomedia

use std::fmt;
use thiserror::Error;

/// Type Result spécialisé pour pmomedia
pub type Result<T> = std::result::Result<T, MediaError>;

/// Échecs du téléchargement d'une ressource
#[derive(Debug, Error)]
pub enum FetchError {
    /// Le serveur ne connaît pas la ressource (404)
    #[error("Resource not found at {0}")]
    NotFound(String),

    /// Le serveur a répondu par une erreur HTTP
    #[error("Remote error: HTTP {0}")]
    RemoteError(u16),

    /// Reprise demandée mais le serveur renvoie le fichier complet
    #[error("Server ignored the resume request (HTTP {0})")]
    ResumeRejected(u16),

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Staging file error: {0}")]
    Io(#[from] std::io::Error),
}

/// Étape du pilotage du service de lecture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceAction {
    Stop,
    Start,
}

impl ServiceAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceAction::Stop => "stop",
            ServiceAction::Start => "start",
        }
    }
}

impl fmt::Display for ServiceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Erreurs du cycle de vie des ressources
#[derive(Debug, Error)]
pub enum MediaError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("Hash mismatch for {name}: expected {expected}, got {computed}")]
    HashMismatch {
        name: String,
        expected: String,
        computed: String,
    },

    #[error("Neither a file name nor a digest was given")]
    MissingArgument,

    #[error("{name} ({digest}) is currently playing and cannot be deleted")]
    PlayingConflict { name: String, digest: String },

    #[error("No such display {0}")]
    Validation(String),

    #[error("{0} is not in the working set")]
    NotPlaced(String),

    #[error("Service {action} error: {service}: {cause}")]
    ServiceControl {
        action: ServiceAction,
        service: String,
        cause: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] serde_json::Error),

    #[error("Background worker failed: {0}")]
    Worker(String),
}

impl MediaError {
    pub fn service(action: ServiceAction, service: &str, cause: impl fmt::Display) -> Self {
        MediaError::ServiceControl {
            action,
            service: service.to_string(),
            cause: cause.to_string(),
        }
    }

    /// Erreurs qui traduisent un mauvais usage ou un invariant : jamais rejouées
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            MediaError::MissingArgument | MediaError::PlayingConflict { .. }
        )
    }
}

//! Bascule de la ressource « lecture en cours » d'une sortie
//!
//! Chaque sortie `display` a un alias `{display}_media.mp4` dans le
//! répertoire de travail, lu par le service de lecture. La bascule remplace
//! l'alias de façon atomique (nouveau lien puis renommage par-dessus
//! l'ancien), le service étant arrêté puis relancé autour de l'échange.

use std::path::Path;

use async_trait::async_trait;
use chrono::Local;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{MediaError, Result, ServiceAction};
use crate::model::{alias_name, CurrentAssignment};
use crate::store::MediaStore;

/// Pilotage du service de lecture
#[async_trait]
pub trait PlaybackService: Send + Sync {
    async fn control(&self, action: ServiceAction, service: &str) -> Result<()>;

    async fn stop(&self, service: &str) -> Result<()> {
        self.control(ServiceAction::Stop, service).await
    }

    async fn start(&self, service: &str) -> Result<()> {
        self.control(ServiceAction::Start, service).await
    }
}

/// `systemctl <action> <service>`, précédé de `sudo` si demandé
#[derive(Debug, Clone)]
pub struct SystemdService {
    use_sudo: bool,
}

impl SystemdService {
    pub fn new(use_sudo: bool) -> Self {
        Self { use_sudo }
    }
}

#[async_trait]
impl PlaybackService for SystemdService {
    async fn control(&self, action: ServiceAction, service: &str) -> Result<()> {
        let mut command = if self.use_sudo {
            let mut command = Command::new("sudo");
            command.arg("systemctl");
            command
        } else {
            Command::new("systemctl")
        };
        command.arg(action.as_str()).arg(service);

        debug!("Running systemctl {} {}", action, service);
        let output = command
            .output()
            .await
            .map_err(|e| MediaError::service(action, service, e))?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(MediaError::service(
                action,
                service,
                format!("{}: {}", output.status, stderr.trim()),
            ))
        }
    }
}

/// Issue d'une bascule
#[derive(Debug)]
pub enum LinkOutcome {
    /// L'alias désignait déjà la ressource
    AlreadySet,
    /// L'alias a été remplacé ; erreurs éventuelles du service de lecture
    Swapped { service_errors: Vec<MediaError> },
}

impl LinkOutcome {
    pub fn promoted(&self) -> bool {
        matches!(self, LinkOutcome::Swapped { .. })
    }

    /// Première erreur de service, pour le rapport au serveur
    pub fn error_message(&self) -> Option<String> {
        match self {
            LinkOutcome::Swapped { service_errors } => {
                service_errors.first().map(|e| e.to_string())
            }
            LinkOutcome::AlreadySet => None,
        }
    }
}

impl MediaStore {
    /// Fait pointer l'alias de `display` sur la ressource de digest `digest`
    pub async fn create_link(&self, display: &str, digest: &str) -> Result<LinkOutcome> {
        let name = self.resolve_name(digest);
        let alias = self.alias_path(display);
        // tracing's macros import `field::display`, which shadows a local named `display`
        let display_id = display;

        if let Ok(existing) = tokio::fs::read_link(&alias).await {
            if existing == Path::new(&name) || existing == self.working_path(&name) {
                debug!(display = %display_id, "{} already current", name);
                return Ok(LinkOutcome::AlreadySet);
            }
        }

        if !self.state().info.has_display(display) {
            return Err(MediaError::Validation(display.to_string()));
        }

        let _guard = self.locks.acquire(&name).await;
        if !self.working_path(&name).is_file() || self.state().files.by_name(&name).is_none() {
            return Err(MediaError::NotPlaced(name));
        }

        let mut service_errors = Vec::new();
        self.drive_service(ServiceAction::Stop, &mut service_errors)
            .await;

        if let Err(e) = swap_alias(&alias, &name).await {
            self.drive_service(ServiceAction::Start, &mut service_errors)
                .await;
            return Err(e);
        }

        {
            let now = Local::now();
            let mut state = self.state();
            if let Some(previous) = state.current.take_display(display) {
                let archived = state.schedule.archive_matching(&previous, &now);
                debug!(
                    display = %display_id,
                    "Replaced {} ({} schedule entries archived)",
                    previous.name,
                    archived
                );
            }
            state.current.assign(CurrentAssignment {
                display: display.to_string(),
                name: name.clone(),
                digest: digest.to_string(),
            });
            state.files.upsert(&alias_name(display), digest);
        }

        self.drive_service(ServiceAction::Start, &mut service_errors)
            .await;

        info!(display = %display_id, "Now playing {}", name);
        Ok(LinkOutcome::Swapped { service_errors })
    }

    /// Télécharge si besoin, puis bascule `display` sur la ressource
    ///
    /// Une ressource dont le digest ne correspond pas n'est jamais affichée.
    pub async fn promote(
        &self,
        display: &str,
        digest: &str,
        name: Option<&str>,
        url: Option<&str>,
    ) -> Result<LinkOutcome> {
        if !self.state().info.has_display(display) {
            return Err(MediaError::Validation(display.to_string()));
        }

        let name = match name {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => self.resolve_name(digest),
        };

        if !self.acquire_resource(&name, digest, url).await? {
            return Err(MediaError::NotPlaced(name));
        }
        self.create_link(display, digest).await
    }

    async fn drive_service(&self, action: ServiceAction, errors: &mut Vec<MediaError>) {
        let service = &self.config.service_name;
        if service.is_empty() {
            return;
        }
        let result = match action {
            ServiceAction::Stop => self.service().stop(service).await,
            ServiceAction::Start => self.service().start(service).await,
        };
        if let Err(e) = result {
            warn!("{}", e);
            errors.push(e);
        }
    }
}

/// Remplace `alias` par un lien vers `name` (même répertoire)
async fn swap_alias(alias: &Path, name: &str) -> Result<()> {
    let mut staged = alias.as_os_str().to_owned();
    staged.push(".tmp");
    let staged = Path::new(&staged);

    match tokio::fs::remove_file(staged).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    tokio::fs::symlink(name, staged).await?;
    tokio::fs::rename(staged, alias).await?;
    Ok(())
}

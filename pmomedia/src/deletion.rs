//! Suppression des ressources

use std::io;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::error::{MediaError, Result};
use crate::model::{default_file_name, Resource};
use crate::store::MediaStore;

impl MediaStore {
    /// Supprime une ressource du registre et du disque
    ///
    /// Le digest prime sur le nom pour identifier la ressource. Une ressource
    /// affichée sur une sortie n'est jamais supprimée.
    pub async fn delete(&self, name: Option<&str>, digest: Option<&str>) -> Result<Resource> {
        let name = name.filter(|n| !n.is_empty());
        let digest = digest.filter(|d| !d.is_empty());

        let (name, digest) = {
            let state = self.state();
            match (digest, name) {
                (Some(digest), name) => {
                    let resolved = state
                        .files
                        .by_digest(digest)
                        .map(|r| r.name.clone())
                        .or_else(|| name.map(str::to_string))
                        .unwrap_or_else(|| default_file_name(digest));
                    (resolved, Some(digest.to_string()))
                }
                (None, Some(name)) => (
                    name.to_string(),
                    state.files.by_name(name).map(|r| r.digest.clone()),
                ),
                (None, None) => return Err(MediaError::MissingArgument),
            }
        };

        self.ensure_not_playing(&name, digest.as_deref())?;
        let guard = self.locks.acquire(&name).await;
        // Une bascule a pu avoir lieu pendant l'attente de la porte
        self.ensure_not_playing(&name, digest.as_deref())?;

        let removed = self.state().files.remove(&name);
        let working = remove_if_exists(&self.working_path(&name)).await;
        let staging = remove_if_exists(&self.staging_path(&name)).await;
        drop(guard);

        // Le registre a déjà changé : le snapshot suit, même en cas d'échec disque
        self.persist().await?;
        working.and(staging).inspect_err(|e| {
            warn!(name = %name, "Resource unregistered but not fully removed: {}", e)
        })?;

        let digest = digest
            .or_else(|| removed.map(|r| r.digest))
            .unwrap_or_default();
        info!(name = %name, digest = %digest, "Resource deleted");
        Ok(Resource::new(name, digest))
    }

    fn ensure_not_playing(&self, name: &str, digest: Option<&str>) -> Result<()> {
        if self.state().current.is_playing(Some(name), digest) {
            return Err(MediaError::PlayingConflict {
                name: name.to_string(),
                digest: digest.unwrap_or_default().to_string(),
            });
        }
        Ok(())
    }
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            debug!("Removed {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

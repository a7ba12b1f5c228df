//! Placement des ressources vérifiées dans le working set

use std::io;

use tracing::{debug, info};

use crate::digest::Verification;
use crate::error::Result;
use crate::store::MediaStore;

impl MediaStore {
    /// Déplace une ressource vérifiée de la zone de transit au working set
    ///
    /// Retourne `false` sans rien toucher si la vérification a échoué ou si
    /// la ressource est occupée par une autre opération. Un fichier de même
    /// nom déjà placé est remplacé.
    pub async fn place(&self, verification: &Verification) -> Result<bool> {
        if !verification.matched {
            return Ok(false);
        }

        let name = verification.name.as_str();
        let Some(_guard) = self.locks.try_acquire(name) else {
            debug!(name = %name, "Resource busy, placement skipped");
            return Ok(false);
        };

        let target = self.working_path(name);
        match tokio::fs::remove_file(&target).await {
            Ok(()) => debug!(name = %name, "Replacing previously placed file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tokio::fs::rename(self.staging_path(name), &target).await?;

        self.state().files.upsert(name, &verification.digest);
        info!(name = %name, digest = %verification.digest, "Resource placed");
        Ok(true)
    }
}

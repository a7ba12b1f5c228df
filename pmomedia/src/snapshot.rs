//! Persistance de l'état (`db.json`)
//!
//! Chaque sauvegarde écrit `<snapshot>.tmp` puis le renomme par-dessus le
//! snapshot précédent. Les écritures sont sérialisées par un mutex async.

use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use crate::error::Result;
use crate::model::MachineState;
use crate::store::MediaStore;

fn staged_path(path: &Path) -> PathBuf {
    let mut staged = path.as_os_str().to_owned();
    staged.push(".tmp");
    PathBuf::from(staged)
}

/// Écrit l'agrégat au format JSON
pub async fn save(path: &Path, state: &MachineState) -> Result<()> {
    let body = serde_json::to_vec_pretty(state)?;
    let staged = staged_path(path);
    tokio::fs::write(&staged, body).await?;
    tokio::fs::rename(&staged, path).await?;
    Ok(())
}

/// Relit un snapshot, `None` s'il n'existe pas
///
/// Les anciens noms de champs (`filename`, `md5hash`, `from`, `url`) sont
/// acceptés.
pub async fn load(path: &Path) -> Result<Option<MachineState>> {
    let body = match tokio::fs::read(path).await {
        Ok(body) => body,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(serde_json::from_slice(&body)?))
}

impl MediaStore {
    /// Sauvegarde l'état courant dans le snapshot
    pub async fn persist(&self) -> Result<()> {
        let _writing = self.persist_lock.lock().await;
        let state = self.snapshot();
        let path = self.snapshot_path();
        save(&path, &state).await?;
        debug!(
            "Snapshot saved: {} files, {} schedule entries, {} current",
            state.files.len(),
            state.schedule.len(),
            state.current.len()
        );
        trace!("Snapshot path {}", path.display());
        Ok(())
    }
}

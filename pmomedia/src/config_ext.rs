//! Extension pour construire le magasin de médias depuis pmoconfig
//!
//! Ce module fournit le trait `MediaConfigExt` qui ajoute à
//! `pmoconfig::Config` la lecture des paramètres de l'agent et la création
//! d'un [`MediaStore`] prêt à l'emploi.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use pmoconfig::Config;

use crate::model::MachineInfo;
use crate::store::{MediaStore, StoreConfig};
use crate::switcher::PlaybackService;

/// Trait d'extension pour pmoconfig
///
/// # Exemple
///
/// ```rust,ignore
/// use pmoconfig::get_config;
/// use pmomedia::{MediaConfigExt, SystemdService};
///
/// let config = get_config();
/// let service = Arc::new(SystemdService::new(config.get_service_use_sudo()?));
/// let store = config.open_media_store(info, service).await?;
/// ```
#[async_trait]
pub trait MediaConfigExt {
    /// Paramètres du magasin lus depuis la configuration
    fn store_config(&self) -> Result<StoreConfig>;

    fn poll_interval(&self) -> Result<Duration>;

    fn scheduler_interval(&self) -> Result<Duration>;

    /// Ouvre le magasin configuré en reprenant l'état persisté
    async fn open_media_store(
        &self,
        info: MachineInfo,
        service: Arc<dyn PlaybackService>,
    ) -> Result<MediaStore>;
}

#[async_trait]
impl MediaConfigExt for Config {
    fn store_config(&self) -> Result<StoreConfig> {
        let working_dir = PathBuf::from(self.get_working_dir()?);
        let mut config = StoreConfig::new(working_dir, &self.get_server_url())
            .with_service_name(&self.get_service_name());
        config.snapshot_file = self.get_snapshot_file();
        config.download_chunk_size = self.get_download_chunk_size()?;
        config.download_timeout = Duration::from_secs(self.get_download_timeout_secs()?);
        config.digest_chunk_size = self.get_digest_chunk_size()?;
        Ok(config)
    }

    fn poll_interval(&self) -> Result<Duration> {
        Ok(Duration::from_secs(self.get_poll_interval_secs()?.max(1)))
    }

    fn scheduler_interval(&self) -> Result<Duration> {
        Ok(Duration::from_secs(self.get_scheduler_interval_secs()?.max(1)))
    }

    async fn open_media_store(
        &self,
        info: MachineInfo,
        service: Arc<dyn PlaybackService>,
    ) -> Result<MediaStore> {
        let config = self.store_config()?;
        Ok(MediaStore::open(config, info, service).await?)
    }
}

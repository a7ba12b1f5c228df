//! Magasin de médias : propriétaire de l'agrégat `MachineState`
//!
//! Les méthodes du magasin sont réparties entre plusieurs modules
//! (`download`, `digest`, `placement`, `switcher`, `deletion`, `snapshot`).
//! Ce module porte la structure, la configuration, l'ouverture avec reprise
//! et la chaîne téléchargement -> vérification -> placement.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::error::{FetchError, MediaError, Result};
use crate::locks::ResourceLocks;
use crate::model::{
    alias_name, default_file_name, is_alias_name, Assignments, MachineInfo, MachineState,
    WorkingSet, MEDIA_EXTENSION,
};
use crate::schedule::ScheduleStore;
use crate::snapshot;
use crate::switcher::PlaybackService;

/// Taille des blocs écrits pendant un téléchargement
pub const DEFAULT_DOWNLOAD_CHUNK_SIZE: usize = 64 * 1024;
/// Taille des blocs hachés par la vérification
pub const DEFAULT_DIGEST_CHUNK_SIZE: usize = 1024 * 1024;
pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Paramètres du magasin
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Répertoire des ressources placées et des alias
    pub working_dir: PathBuf,
    /// Zone de transit des téléchargements
    pub downloading_dir: PathBuf,
    /// Nom du snapshot dans `working_dir`
    pub snapshot_file: String,
    /// URL de base du serveur de contrôle
    pub server_url: String,
    /// Service de lecture (vide : pas de pilotage)
    pub service_name: String,
    pub download_chunk_size: usize,
    pub download_timeout: Duration,
    pub digest_chunk_size: usize,
}

impl StoreConfig {
    pub fn new(working_dir: impl Into<PathBuf>, server_url: &str) -> Self {
        let working_dir = working_dir.into();
        Self {
            downloading_dir: working_dir.join("downloading"),
            working_dir,
            snapshot_file: "db.json".to_string(),
            server_url: server_url.trim_end_matches('/').to_string(),
            service_name: String::new(),
            download_chunk_size: DEFAULT_DOWNLOAD_CHUNK_SIZE,
            download_timeout: DEFAULT_DOWNLOAD_TIMEOUT,
            digest_chunk_size: DEFAULT_DIGEST_CHUNK_SIZE,
        }
    }

    pub fn with_service_name(mut self, service_name: &str) -> Self {
        self.service_name = service_name.to_string();
        self
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.working_dir.join(&self.snapshot_file)
    }
}

/// Magasin de médias d'un appareil
pub struct MediaStore {
    pub(crate) config: StoreConfig,
    pub(crate) state: Mutex<MachineState>,
    pub(crate) locks: ResourceLocks,
    /// Une seule chaîne téléchargement -> placement à la fois par nom
    pub(crate) pipelines: ResourceLocks,
    pub(crate) client: reqwest::Client,
    pub(crate) service: Arc<dyn PlaybackService>,
    pub(crate) persist_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for MediaStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaStore")
            .field("working_dir", &self.config.working_dir)
            .field("server_url", &self.config.server_url)
            .finish()
    }
}

impl MediaStore {
    /// Crée un magasin vide, sans lire le snapshot
    ///
    /// Les répertoires de travail et de transit sont créés si besoin.
    pub fn new(
        config: StoreConfig,
        mut info: MachineInfo,
        service: Arc<dyn PlaybackService>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&config.working_dir)?;
        std::fs::create_dir_all(&config.downloading_dir)?;

        info.working_dir = config.working_dir.clone();
        info.downloading_dir = config.downloading_dir.clone();
        info.service = if config.service_name.is_empty() {
            None
        } else {
            Some(config.service_name.clone())
        };

        let client = reqwest::Client::builder()
            .timeout(config.download_timeout)
            .build()
            .map_err(FetchError::Transport)?;

        Ok(Self {
            state: Mutex::new(MachineState {
                info,
                ..MachineState::default()
            }),
            config,
            locks: ResourceLocks::new(),
            pipelines: ResourceLocks::new(),
            client,
            service,
            persist_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Ouvre le magasin en reprenant l'état précédent
    ///
    /// Le planning et les affectations viennent du snapshot ; une affectation
    /// dont l'alias a disparu est abandonnée. Le registre du working set est
    /// reconstruit en hachant les fichiers présents sur disque.
    pub async fn open(
        config: StoreConfig,
        info: MachineInfo,
        service: Arc<dyn PlaybackService>,
    ) -> Result<Self> {
        let store = Self::new(config, info, service)?;
        let snapshot_path = store.config.snapshot_path();

        let previous = match snapshot::load(&snapshot_path).await {
            Ok(previous) => previous,
            Err(e) => {
                warn!("Unable to read snapshot {}: {}", snapshot_path.display(), e);
                None
            }
        };

        let mut current = Assignments::default();
        let mut schedule = ScheduleStore::default();
        if let Some(previous) = previous {
            current = previous.current;
            current.retain(|assignment| {
                let kept = store.alias_path(&assignment.display).is_symlink();
                if !kept {
                    warn!(
                        display = %assignment.display,
                        "Alias missing, dropping current assignment {}", assignment.name
                    );
                }
                kept
            });
            schedule = previous.schedule;
            info!(
                "Snapshot restored: {} schedule entries, {} current assignments",
                schedule.len(),
                current.len()
            );
        }

        let mut files = store.rescan().await?;
        for assignment in current.iter() {
            files.upsert(&alias_name(&assignment.display), &assignment.digest);
        }

        {
            let mut state = store.state();
            state.current = current;
            state.schedule = schedule;
            state.files = files;
        }

        Ok(store)
    }

    /// Hache chaque fichier vidéo (hors liens) du répertoire de travail
    async fn rescan(&self) -> Result<WorkingSet> {
        let mut names = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.config.working_dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let file_type = entry.file_type().await?;
            if !file_type.is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(MEDIA_EXTENSION) {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if !is_alias_name(name) {
                    names.push(name.to_string());
                }
            }
        }

        let chunk_size = self.config.digest_chunk_size;
        let hashed = join_all(names.into_iter().map(|name| {
            let path = self.working_path(&name);
            async move {
                let digest = crate::digest::file_md5(&path, chunk_size).await;
                (name, digest)
            }
        }))
        .await;

        let mut files = WorkingSet::default();
        for (name, digest) in hashed {
            match digest {
                Ok(digest) => {
                    debug!(name = %name, digest = %digest, "Working set file registered");
                    files.upsert(&name, &digest);
                }
                Err(e) => warn!(name = %name, "Unable to hash working set file: {}", e),
            }
        }
        info!("Working set rebuilt: {} files", files.len());
        Ok(files)
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, MachineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copie de l'agrégat complet
    pub fn snapshot(&self) -> MachineState {
        self.state().clone()
    }

    pub fn info(&self) -> MachineInfo {
        self.state().info.clone()
    }

    pub fn files(&self) -> WorkingSet {
        self.state().files.clone()
    }

    pub fn current(&self) -> Assignments {
        self.state().current.clone()
    }

    pub fn schedule(&self) -> ScheduleStore {
        self.state().schedule.clone()
    }

    pub fn displays(&self) -> Vec<String> {
        self.state().info.displays.clone()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn locks(&self) -> &ResourceLocks {
        &self.locks
    }

    /// Libère les portes inutilisées ; retourne le nombre de portes retirées
    pub fn prune_gates(&self) -> usize {
        self.locks.prune() + self.pipelines.prune()
    }

    pub(crate) fn service(&self) -> &Arc<dyn PlaybackService> {
        &self.service
    }

    pub fn working_path(&self, name: &str) -> PathBuf {
        self.config.working_dir.join(name)
    }

    pub fn staging_path(&self, name: &str) -> PathBuf {
        self.config.downloading_dir.join(name)
    }

    pub fn alias_path(&self, display: &str) -> PathBuf {
        self.working_path(&alias_name(display))
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.config.snapshot_path()
    }

    pub fn working_dir(&self) -> &Path {
        &self.config.working_dir
    }

    /// URL de téléchargement par défaut d'une ressource
    pub fn default_source_url(&self, digest: &str) -> String {
        format!("{}/files/{}", self.config.server_url, digest)
    }

    /// Nom de fichier d'une ressource connue par son digest
    pub fn resolve_name(&self, digest: &str) -> String {
        self.state()
            .files
            .by_digest(digest)
            .map(|r| r.name.clone())
            .unwrap_or_else(|| default_file_name(digest))
    }

    /// Vrai si la ressource est déjà placée avec ce contenu
    pub fn is_placed(&self, name: &str, digest: &str) -> bool {
        self.state().files.contains(name, digest) && self.working_path(name).is_file()
    }

    /// Télécharge, vérifie et place une ressource
    ///
    /// Retourne `true` si la ressource est dans le working set à l'issue de
    /// l'appel (déjà présente ou fraîchement placée). Deux appels sur le même
    /// nom s'enchaînent : le second constate le placement fait par le premier.
    pub async fn acquire_resource(
        &self,
        name: &str,
        digest: &str,
        url: Option<&str>,
    ) -> Result<bool> {
        if self.is_placed(name, digest) {
            debug!(name = %name, "Resource already placed");
            return Ok(true);
        }

        let _pipeline = self.pipelines.acquire(name).await;
        if self.is_placed(name, digest) {
            debug!(name = %name, "Resource placed by a concurrent pipeline");
            return Ok(true);
        }

        let url = match url {
            Some(url) => url.to_string(),
            None => self.default_source_url(digest),
        };

        self.fetch(&url, name).await?;
        let verification = self.verify(name, Some(digest)).await?;
        if !verification.matched {
            // Une copie corrompue ne doit pas servir de base à une reprise
            self.discard_staging(name).await;
            return Err(MediaError::HashMismatch {
                name: name.to_string(),
                expected: digest.to_string(),
                computed: verification.digest,
            });
        }
        if self.place(&verification).await? {
            return Ok(true);
        }

        // Placement sauté (porte occupée) : attendre l'opération en cours
        drop(self.locks.acquire(name).await);
        Ok(self.is_placed(name, digest))
    }

    async fn discard_staging(&self, name: &str) {
        let _guard = self.locks.acquire(name).await;
        match tokio::fs::remove_file(self.staging_path(name)).await {
            Ok(()) => debug!(name = %name, "Staging copy discarded"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(name = %name, "Unable to discard staging copy: {}", e),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use tempfile::TempDir;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_store_config_defaults() {
        let config = StoreConfig::new("/srv/media", "http://server:8000/");
        assert_eq!(config.downloading_dir, PathBuf::from("/srv/media/downloading"));
        assert_eq!(config.snapshot_path(), PathBuf::from("/srv/media/db.json"));
        assert_eq!(config.server_url, "http://server:8000");
    }

    #[test]
    fn test_new_creates_directories() {
        let dir = TempDir::new().unwrap();
        let store = test_store(dir.path(), "http://localhost", Arc::default());

        assert!(store.working_dir().is_dir());
        assert!(store.staging_path("x").parent().unwrap().is_dir());
        assert_eq!(store.info().service.as_deref(), Some("mediaplayer"));
        assert_eq!(store.default_source_url("abc"), "http://localhost/files/abc");
        assert_eq!(store.resolve_name("abc"), "abc.mp4");
    }

    #[tokio::test]
    async fn test_acquire_resource_pipeline() {
        let server = MockServer::start().await;
        let body = b"some video bytes".to_vec();
        let digest = md5_hex(&body);
        Mock::given(method("GET"))
            .and(path(format!("/files/{}", digest)))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let store = test_store(dir.path(), &server.uri(), Arc::default());
        let name = format!("{}.mp4", digest);

        assert!(store.acquire_resource(&name, &digest, None).await.unwrap());
        assert_eq!(std::fs::read(store.working_path(&name)).unwrap(), body);
        assert!(!store.staging_path(&name).exists());
        assert!(store.files().contains(&name, &digest));

        // Déjà placée : aucune nouvelle requête
        assert!(store.acquire_resource(&name, &digest, None).await.unwrap());
    }

    #[tokio::test]
    async fn test_acquire_resource_hash_mismatch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bad.mp4"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"corrupted".to_vec()))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let store = test_store(dir.path(), &server.uri(), Arc::default());
        let url = format!("{}/bad.mp4", server.uri());

        let err = store
            .acquire_resource("bad.mp4", "00000000000000000000000000000000", Some(&url))
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::HashMismatch { .. }));
        assert!(!store.working_path("bad.mp4").exists());
        assert!(store.files().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_acquire_same_resource() {
        let server = MockServer::start().await;
        let body = b"shared clip bytes".to_vec();
        let digest = md5_hex(&body);
        Mock::given(method("GET"))
            .and(path(format!("/files/{}", digest)))
            .and(header("Range", "bytes=0-"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(body.clone())
                    .set_delay(Duration::from_millis(50)),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(416))
            .expect(0)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let store = test_store(dir.path(), &server.uri(), Arc::default());
        let name = format!("{}.mp4", digest);

        let (a, b) = tokio::join!(
            store.acquire_resource(&name, &digest, None),
            store.acquire_resource(&name, &digest, None)
        );
        assert!(a.unwrap());
        assert!(b.unwrap());
        assert!(store.is_placed(&name, &digest));
        assert_eq!(std::fs::read(store.working_path(&name)).unwrap(), body);
        assert!(store.locks().is_free(&name));
        assert_eq!(store.prune_gates(), 2);
    }

    #[tokio::test]
    async fn test_open_rebuilds_working_set_and_drops_stale_assignments() {
        let dir = TempDir::new().unwrap();
        let digest_a;
        {
            let store = test_store(dir.path(), "http://localhost", Arc::default());
            digest_a = place_bytes(&store, "a.mp4", b"aaaa");
            place_bytes(&store, "b.mp4", b"bbbb");
            std::os::unix::fs::symlink(store.working_path("a.mp4"), store.alias_path("1")).unwrap();
            {
                let mut state = store.state();
                state.current.assign(crate::model::CurrentAssignment {
                    display: "1".into(),
                    name: "a.mp4".into(),
                    digest: digest_a.clone(),
                });
                state.current.assign(crate::model::CurrentAssignment {
                    display: "2".into(),
                    name: "b.mp4".into(),
                    digest: md5_hex(b"bbbb"),
                });
            }
            store.persist().await.unwrap();
        }
        std::fs::write(dir.path().join("media").join("notes.txt"), b"ignored").unwrap();

        let config = StoreConfig::new(dir.path().join("media"), "http://localhost");
        let store = MediaStore::open(config, machine_info(&["1", "2"]), Arc::new(RecordingService::default()))
            .await
            .unwrap();

        let files = store.files();
        assert_eq!(files.len(), 3);
        assert!(files.contains("a.mp4", &digest_a));
        assert!(files.contains("b.mp4", &md5_hex(b"bbbb")));
        assert!(files.contains("1_media.mp4", &digest_a));

        let current = store.current();
        assert_eq!(current.len(), 1);
        assert_eq!(current.for_display("1").unwrap().name, "a.mp4");
        assert!(current.for_display("2").is_none());
    }
}

//! # pmomedia - Cycle de vie des médias de PMOSignage
//!
//! Cette crate maintient sur disque un ensemble de vidéos synchronisé avec le
//! planning déclaré par un serveur de contrôle, et bascule au bon moment la
//! vidéo « en cours » de chaque sortie de l'appareil.
//!
//! ## Vue d'ensemble
//!
//! Chaque ressource (un fichier identifié par son nom et son MD5) suit le
//! chemin :
//!
//! ```text
//! téléchargement -> vérification -> placement -> affichage -> suppression
//!  (downloading/)      (MD5)        (working/)   ({display}_media.mp4)
//! ```
//!
//! Toutes les opérations sur un même nom passent par une porte dédiée
//! ([`ResourceLocks`]) : jamais deux opérations simultanées sur une ressource.
//!
//! ## Architecture
//!
//! ```text
//! pmomedia
//!     ├── store.rs      - MediaStore, propriétaire de l'état
//!     ├── locks.rs      - portes par ressource
//!     ├── download.rs   - téléchargement avec reprise (Range)
//!     ├── digest.rs     - vérification MD5
//!     ├── placement.rs  - transit -> working set
//!     ├── switcher.rs   - bascule des alias, service de lecture
//!     ├── deletion.rs   - suppression
//!     ├── schedule.rs   - planning
//!     ├── snapshot.rs   - persistance db.json
//!     ├── tasks.rs      - décodage des lots de tâches
//!     ├── remote.rs     - serveur de contrôle
//!     └── sync.rs       - boucles poller et scheduler
//! ```
//!
//! ## Utilisation
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pmomedia::{
//!     ControlPlane, MachineInfo, MediaStore, StoreConfig, SyncAgent, SystemdService,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let info = MachineInfo {
//!         serial: "100000001234".to_string(),
//!         displays: vec!["HDMI-A-1".to_string()],
//!         ..MachineInfo::default()
//!     };
//!     let config = StoreConfig::new("./media", "http://localhost:8000")
//!         .with_service_name("mediaplayer");
//!     let store = Arc::new(
//!         MediaStore::open(config, info, Arc::new(SystemdService::new(true))).await?,
//!     );
//!
//!     let plane = Arc::new(ControlPlane::new(
//!         "http://localhost:8000",
//!         "100000001234",
//!         std::time::Duration::from_secs(30),
//!     )?);
//!     SyncAgent::new(store, plane.clone(), plane).run().await;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod locks;
pub mod model;
pub mod schedule;
pub mod snapshot;
pub mod store;
pub mod tasks;

mod deletion;
mod digest;
mod download;
mod placement;
mod remote;
mod switcher;
mod sync;

#[cfg(feature = "pmoconfig")]
pub mod config_ext;

pub use digest::{digest_from_name, file_md5, Verification, BROKEN_LINK};
pub use download::fetch_to_file;
pub use error::{FetchError, MediaError, Result, ServiceAction};
pub use locks::{ResourceGuard, ResourceLocks};
pub use model::{
    alias_name, Assignments, CurrentAssignment, EntryIdentity, EntryState, MachineInfo,
    MachineState, Resource, ScheduleEntry, WorkingSet,
};
pub use remote::{
    ControlPlane, CurrentReport, LogSink, ScheduleReport, SnapshotTaskSource, StatusSink,
    TaskSource,
};
pub use schedule::ScheduleStore;
pub use store::{MediaStore, StoreConfig};
pub use switcher::{LinkOutcome, PlaybackService, SystemdService};
pub use sync::{SyncAgent, SyncReport};
pub use tasks::{DeleteTask, PromoteTask, Task, TaskBatch};

#[cfg(feature = "pmoconfig")]
pub use config_ext::MediaConfigExt;

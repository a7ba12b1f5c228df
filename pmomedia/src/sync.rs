//! Cycle de synchronisation
//!
//! Deux boucles tournent pendant toute la vie du processus :
//!
//! - le *poller* récupère un lot de tâches (suppressions, affichages
//!   immédiats, planning), les applique puis sauvegarde l'état ;
//! - le *scheduler* promeut, à chaque tick, la dernière entrée active de
//!   chaque sortie.
//!
//! Une erreur sur une ressource est journalisée et n'interrompt jamais le lot.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use futures::future::join_all;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::model::{EntryState, ScheduleEntry};
use crate::remote::{CurrentReport, SnapshotTaskSource, StatusSink, TaskSource};
use crate::store::MediaStore;
use crate::tasks::{PromoteTask, TaskBatch};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_SCHEDULER_INTERVAL: Duration = Duration::from_secs(60);

/// Bilan d'un cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub deleted: usize,
    pub promoted: usize,
    pub downloaded: usize,
    pub scheduled: usize,
    pub failed: usize,
}

/// Agent de synchronisation d'un appareil
pub struct SyncAgent {
    store: Arc<MediaStore>,
    source: Arc<dyn TaskSource>,
    fallback: Option<Arc<dyn TaskSource>>,
    sink: Arc<dyn StatusSink>,
    poll_interval: Duration,
    scheduler_interval: Duration,
}

impl SyncAgent {
    /// Agent dont la source de secours est le snapshot du magasin
    pub fn new(
        store: Arc<MediaStore>,
        source: Arc<dyn TaskSource>,
        sink: Arc<dyn StatusSink>,
    ) -> Self {
        let fallback: Arc<dyn TaskSource> = Arc::new(SnapshotTaskSource::new(store.snapshot_path()));
        Self {
            store,
            source,
            fallback: Some(fallback),
            sink,
            poll_interval: DEFAULT_POLL_INTERVAL,
            scheduler_interval: DEFAULT_SCHEDULER_INTERVAL,
        }
    }

    pub fn with_fallback(mut self, fallback: Option<Arc<dyn TaskSource>>) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn with_intervals(mut self, poll: Duration, scheduler: Duration) -> Self {
        self.poll_interval = poll;
        self.scheduler_interval = scheduler;
        self
    }

    pub fn store(&self) -> &Arc<MediaStore> {
        &self.store
    }

    async fn next_batch(&self) -> TaskBatch {
        match self.source.fetch_tasks().await {
            Ok(batch) => batch,
            Err(e) => {
                warn!("Unable to fetch tasks: {}", e);
                let Some(fallback) = &self.fallback else {
                    return TaskBatch::default();
                };
                match fallback.fetch_tasks().await {
                    Ok(batch) => {
                        info!("Replaying {} pending tasks from snapshot", batch.len());
                        batch
                    }
                    Err(e) => {
                        warn!("Fallback task source failed: {}", e);
                        TaskBatch::default()
                    }
                }
            }
        }
    }

    /// Un tour du poller : lot, application, sauvegarde
    pub async fn sync_once(&self) -> Result<SyncReport> {
        let batch = self.next_batch().await;
        self.apply_batch(&batch).await
    }

    /// Applique un lot : suppressions, affichages immédiats puis planning
    pub async fn apply_batch(&self, batch: &TaskBatch) -> Result<SyncReport> {
        let mut report = SyncReport::default();

        let deletions: Vec<_> = batch.deletions().collect();
        if !deletions.is_empty() {
            let results = join_all(deletions.iter().map(|task| {
                self.store
                    .delete(task.name.as_deref(), task.digest.as_deref())
            }))
            .await;
            for (task, result) in deletions.iter().zip(results) {
                match result {
                    Ok(_) => report.deleted += 1,
                    Err(e) => {
                        report.failed += 1;
                        warn!(
                            "Unable to delete {:?} ({:?}): {}",
                            task.name, task.digest, e
                        );
                    }
                }
            }
            self.store.persist().await?;
        }

        let promotions: Vec<&PromoteTask> = batch.promotions().collect();
        if !promotions.is_empty() {
            let (promoted, failed) = self.apply_promotions(&promotions).await;
            report.promoted += promoted;
            report.failed += failed;
            self.store.persist().await?;
        }

        let mut schedules: Vec<&ScheduleEntry> = batch.schedules().collect();
        if !schedules.is_empty() {
            schedules.sort_by_key(|entry| entry.activation_time());

            let mut launched = HashSet::new();
            let mut pipelines = Vec::new();
            for entry in schedules {
                let resource = (entry.name.clone(), entry.digest.clone());
                if !self.store.is_placed(&entry.name, &entry.digest) && launched.insert(resource) {
                    pipelines.push(self.download(entry));
                }
                self.store.upsert_schedule(entry.clone());
                report.scheduled += 1;
            }

            for result in join_all(pipelines).await {
                match result {
                    Ok(true) => report.downloaded += 1,
                    Ok(false) => {}
                    Err(_) => report.failed += 1,
                }
            }
            self.store.persist().await?;
        }

        Ok(report)
    }

    async fn download(&self, entry: &ScheduleEntry) -> Result<bool> {
        self.store
            .acquire_resource(&entry.name, &entry.digest, entry.source_url.as_deref())
            .await
            .inspect_err(|e| warn!(name = %entry.name, "Scheduled download failed: {}", e))
    }

    /// Affichages immédiats, une chaîne par ressource
    ///
    /// Une tâche sans sortie vaut pour toutes les sorties de l'appareil.
    async fn apply_promotions(&self, promotions: &[&PromoteTask]) -> (usize, usize) {
        let displays = self.store.displays();
        let mut by_resource: BTreeMap<(String, String), Vec<(PromoteTask, String)>> =
            BTreeMap::new();
        for task in promotions {
            let name = match task.name.as_deref() {
                Some(name) if !name.is_empty() => name.to_string(),
                _ => self.store.resolve_name(&task.digest),
            };
            let targets = match &task.display {
                Some(display) => vec![display.clone()],
                None => displays.clone(),
            };
            let group = by_resource.entry((name, task.digest.clone())).or_default();
            for display in targets {
                group.push(((*task).clone(), display));
            }
        }

        let outcomes = join_all(by_resource.into_iter().map(|((name, _), targets)| async move {
            let mut promoted = 0;
            let mut failed = 0;
            for (task, display) in targets {
                let result = self
                    .store
                    .promote(&display, &task.digest, Some(&name), task.url.as_deref())
                    .await;
                let (status, error) = match &result {
                    Ok(outcome) => {
                        if outcome.promoted() {
                            promoted += 1;
                        }
                        (outcome.promoted(), outcome.error_message())
                    }
                    Err(e) => {
                        failed += 1;
                        // tracing's macros import `field::display`, which shadows a local named `display`
                        let display_id = &display;
                        warn!(display = %display_id, "Promotion of {} failed: {}", name, e);
                        (false, Some(e.to_string()))
                    }
                };
                let report = CurrentReport {
                    task: PromoteTask {
                        display: Some(display),
                        ..task
                    },
                    status,
                    error,
                };
                self.sink.report_current(&report).await;
            }
            (promoted, failed)
        }))
        .await;

        outcomes
            .into_iter()
            .fold((0, 0), |(p, f), (promoted, failed)| (p + promoted, f + failed))
    }

    /// Un tick du scheduler à l'instant `now`
    ///
    /// Retourne le nombre de sorties effectivement basculées.
    pub async fn schedule_tick(&self, now: DateTime<Local>) -> Result<usize> {
        let superseded = self.store.supersede_due(&now);
        if superseded > 0 {
            debug!("{} schedule entries superseded", superseded);
        }

        // Une chaîne par ressource : deux sorties ne téléchargent pas le même fichier
        let mut by_resource: BTreeMap<(String, String), Vec<ScheduleEntry>> = BTreeMap::new();
        for entry in self.store.promotion_candidates(&now) {
            by_resource
                .entry((entry.name.clone(), entry.digest.clone()))
                .or_default()
                .push(entry);
        }
        let outcomes: Vec<(bool, bool)> = join_all(by_resource.into_values().map(|entries| async move {
            let mut outcomes = Vec::with_capacity(entries.len());
            for entry in &entries {
                outcomes.push(self.promote_entry(entry).await);
            }
            outcomes
        }))
        .await
        .into_iter()
        .flatten()
        .collect();

        let promoted = outcomes.iter().filter(|(promoted, _)| *promoted).count();
        let changed = outcomes.iter().any(|(_, changed)| *changed);
        if superseded > 0 || changed {
            self.store.persist().await?;
        }
        Ok(promoted)
    }

    /// Promeut une entrée et consigne le résultat ; `(basculée, modifiée)`
    async fn promote_entry(&self, entry: &ScheduleEntry) -> (bool, bool) {
        let result = self
            .store
            .promote(
                &entry.display,
                &entry.digest,
                Some(&entry.name),
                entry.source_url.as_deref(),
            )
            .await;

        let (state, status, error, promoted) = match &result {
            Ok(outcome) => (
                EntryState::Current,
                Some(outcome.promoted()),
                outcome.error_message(),
                outcome.promoted(),
            ),
            Err(e) => {
                warn!(display = %entry.display, "Scheduled promotion of {} failed: {}", entry.name, e);
                (EntryState::Error, Some(false), Some(e.to_string()), false)
            }
        };

        let changed = entry.state != state || promoted;
        let Some(updated) =
            self.store
                .record_schedule_outcome(&entry.identity(), state, status, error)
        else {
            return (promoted, false);
        };

        if promoted || state == EntryState::Error {
            self.sink.report_schedule(&updated).await;
        }
        (promoted, changed)
    }

    /// Boucle du poller
    pub async fn run_poller(&self) {
        info!("Poller started (every {:?})", self.poll_interval);
        loop {
            match self.sync_once().await {
                Ok(report) => debug!("Sync cycle done: {:?}", report),
                Err(e) => error!("Sync cycle failed: {}", e),
            }
            let pruned = self.store.prune_gates();
            if pruned > 0 {
                debug!("{} idle resource gates pruned", pruned);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Boucle du scheduler
    pub async fn run_scheduler(&self) {
        info!("Scheduler started (every {:?})", self.scheduler_interval);
        loop {
            match self.schedule_tick(Local::now()).await {
                Ok(0) => {}
                Ok(promoted) => info!("{} displays switched by schedule", promoted),
                Err(e) => error!("Scheduler tick failed: {}", e),
            }
            tokio::time::sleep(self.scheduler_interval).await;
        }
    }

    /// Fait tourner les deux boucles ; ne rend jamais la main
    pub async fn run(&self) {
        tokio::join!(self.run_poller(), self.run_scheduler());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FetchError, MediaError};
    use crate::model::ScheduleEntry;
    use crate::store::testing::*;
    use crate::tasks::{DeleteTask, Task};
    use async_trait::async_trait;
    use chrono::Duration as Days;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Default)]
    struct RecordingSink {
        schedules: Mutex<Vec<ScheduleEntry>>,
        currents: Mutex<Vec<CurrentReport>>,
    }

    #[async_trait]
    impl StatusSink for RecordingSink {
        async fn report_schedule(&self, entry: &ScheduleEntry) {
            self.schedules.lock().unwrap().push(entry.clone());
        }

        async fn report_current(&self, report: &CurrentReport) {
            self.currents.lock().unwrap().push(report.clone());
        }
    }

    struct FixedSource(Result<TaskBatch>);

    #[async_trait]
    impl TaskSource for FixedSource {
        async fn fetch_tasks(&self) -> Result<TaskBatch> {
            match &self.0 {
                Ok(batch) => Ok(batch.clone()),
                Err(_) => Err(FetchError::RemoteError(502).into()),
            }
        }
    }

    fn agent(store: MediaStore, source: FixedSource, sink: Arc<RecordingSink>) -> SyncAgent {
        SyncAgent::new(Arc::new(store), Arc::new(source), sink)
    }

    async fn serve(server: &MockServer, route: &str, body: &[u8]) {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.to_vec()))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_apply_batch_deletes_and_promotes() {
        let server = MockServer::start().await;
        let body = b"promoted clip";
        let digest = md5_hex(body);
        serve(&server, &format!("/files/{}", digest), body).await;

        let dir = TempDir::new().unwrap();
        let store = test_store(dir.path(), &server.uri(), Arc::default());
        let old = place_bytes(&store, "old.mp4", b"old");
        let sink = Arc::new(RecordingSink::default());
        let agent = agent(store, FixedSource(Ok(TaskBatch::default())), sink.clone());

        let batch = TaskBatch::new(vec![
            Task::Delete(DeleteTask {
                name: None,
                digest: Some(old),
            }),
            Task::Promote(PromoteTask {
                display: None,
                digest: digest.clone(),
                name: None,
                url: None,
            }),
        ]);
        let report = agent.apply_batch(&batch).await.unwrap();

        assert_eq!(report.deleted, 1);
        assert_eq!(report.promoted, 2);
        assert_eq!(report.failed, 0);

        let store = agent.store();
        assert!(!store.working_path("old.mp4").exists());
        assert_eq!(std::fs::read(store.alias_path("1")).unwrap(), body);
        assert_eq!(std::fs::read(store.alias_path("2")).unwrap(), body);

        let currents = sink.currents.lock().unwrap().clone();
        assert_eq!(currents.len(), 2);
        assert!(currents.iter().all(|r| r.status && r.error.is_none()));
        let mut displays: Vec<_> = currents.iter().filter_map(|r| r.task.display.clone()).collect();
        displays.sort();
        assert_eq!(displays, vec!["1", "2"]);
    }

    #[tokio::test]
    async fn test_failed_promotion_is_reported() {
        let server = MockServer::start().await;
        serve(&server, "/files/abc", b"not matching").await;

        let dir = TempDir::new().unwrap();
        let store = test_store(dir.path(), &server.uri(), Arc::default());
        let sink = Arc::new(RecordingSink::default());
        let agent = agent(store, FixedSource(Ok(TaskBatch::default())), sink.clone());

        let batch: TaskBatch = vec![Task::Promote(PromoteTask {
            display: Some("1".into()),
            digest: "abc".into(),
            name: None,
            url: None,
        })]
        .into_iter()
        .collect();
        let report = agent.apply_batch(&batch).await.unwrap();

        assert_eq!(report.failed, 1);
        let currents = sink.currents.lock().unwrap().clone();
        assert_eq!(currents.len(), 1);
        assert!(!currents[0].status);
        assert!(currents[0].error.as_deref().unwrap().contains("Hash mismatch"));
        assert!(agent.store().current().is_empty());
    }

    #[tokio::test]
    async fn test_schedule_batch_downloads_once_per_resource() {
        let server = MockServer::start().await;
        let body = b"scheduled clip";
        let digest = md5_hex(body);
        Mock::given(method("GET"))
            .and(path(format!("/files/{}", digest)))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let store = test_store(dir.path(), &server.uri(), Arc::default());
        let sink = Arc::new(RecordingSink::default());
        let agent = agent(store, FixedSource(Ok(TaskBatch::default())), sink);

        let today = Local::now().date_naive();
        let name = format!("{}.mp4", digest);
        let batch: TaskBatch = [
            ScheduleEntry::new("1", today + Days::days(3), name.clone(), digest.clone()),
            ScheduleEntry::new("2", today + Days::days(1), name.clone(), digest.clone()),
        ]
        .into_iter()
        .map(Task::Schedule)
        .collect();

        let report = agent.apply_batch(&batch).await.unwrap();
        assert_eq!(report.scheduled, 2);
        assert_eq!(report.downloaded, 1);
        assert!(agent.store().is_placed(&name, &digest));
        assert_eq!(agent.store().schedule().len(), 2);
        assert!(agent.store().snapshot_path().exists());

        // Nouveau lot identique : rien à télécharger
        let report = agent.apply_batch(&batch).await.unwrap();
        assert_eq!(report.downloaded, 0);
        assert_eq!(agent.store().schedule().len(), 2);
    }

    #[tokio::test]
    async fn test_schedule_tick_promotes_latest_due_entry() {
        let dir = TempDir::new().unwrap();
        let store = test_store(dir.path(), "http://localhost", Arc::default());
        let old = place_bytes(&store, "old.mp4", b"old");
        let new = place_bytes(&store, "new.mp4", b"new");
        let sink = Arc::new(RecordingSink::default());
        let agent = agent(store, FixedSource(Ok(TaskBatch::default())), sink.clone());

        let today = Local::now().date_naive();
        let older = ScheduleEntry::new("1", today - Days::days(3), "old.mp4", old);
        let newer = ScheduleEntry::new("1", today - Days::days(1), "new.mp4", new);
        let future = ScheduleEntry::new("1", today + Days::days(2), "old.mp4", older.digest.clone());
        for entry in [&older, &newer, &future] {
            agent.store().upsert_schedule(entry.clone());
        }

        assert_eq!(agent.schedule_tick(Local::now()).await.unwrap(), 1);

        let schedule = agent.store().schedule();
        assert_eq!(schedule.get(&older.identity()).unwrap().state, EntryState::Archived);
        assert_eq!(schedule.get(&newer.identity()).unwrap().state, EntryState::Current);
        assert_eq!(schedule.get(&future.identity()).unwrap().state, EntryState::Scheduled);
        assert_eq!(std::fs::read(agent.store().alias_path("1")).unwrap(), b"new");

        let reported = sink.schedules.lock().unwrap().clone();
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].status, Some(true));

        // Second tick : déjà en place, rien de nouveau
        assert_eq!(agent.schedule_tick(Local::now()).await.unwrap(), 0);
        assert_eq!(sink.schedules.lock().unwrap().len(), 1);
        assert_eq!(
            agent.store().schedule().get(&newer.identity()).unwrap().state,
            EntryState::Current
        );
    }

    #[tokio::test]
    async fn test_poll_and_tick_share_one_download() {
        let server = MockServer::start().await;
        let body = b"due clip";
        let digest = md5_hex(body);
        Mock::given(method("GET"))
            .and(path(format!("/files/{}", digest)))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(body.to_vec())
                    .set_delay(Duration::from_millis(50)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let store = test_store(dir.path(), &server.uri(), Arc::default());
        let name = format!("{}.mp4", digest);
        let yesterday = Local::now().date_naive() - Days::days(1);
        let entry = ScheduleEntry::new("1", yesterday, name.clone(), digest.clone());
        let batch = TaskBatch::new(vec![Task::Schedule(entry.clone())]);
        let sink = Arc::new(RecordingSink::default());
        let agent = agent(store, FixedSource(Ok(batch)), sink.clone());

        // Le tick démarre dès que le poller a enregistré l'entrée
        let tick = async {
            while agent.store().schedule().is_empty() {
                tokio::task::yield_now().await;
            }
            agent.schedule_tick(Local::now()).await
        };
        let (report, promoted) = tokio::join!(agent.sync_once(), tick);
        assert_eq!(report.unwrap().failed, 0);
        assert_eq!(promoted.unwrap(), 1);

        let stored = agent.store().schedule().get(&entry.identity()).cloned().unwrap();
        assert_eq!(stored.state, EntryState::Current);
        assert_eq!(stored.status, Some(true));
        assert!(stored.error.is_none());
        assert_eq!(std::fs::read(agent.store().alias_path("1")).unwrap(), body);

        let reported = sink.schedules.lock().unwrap().clone();
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].status, Some(true));
    }

    #[tokio::test]
    async fn test_schedule_tick_records_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let store = test_store(dir.path(), &server.uri(), Arc::default());
        let sink = Arc::new(RecordingSink::default());
        let agent = agent(store, FixedSource(Ok(TaskBatch::default())), sink.clone());

        let yesterday = Local::now().date_naive() - Days::days(1);
        let entry = ScheduleEntry::new("2", yesterday, "gone.mp4", "d41d8cd98f00b204e9800998ecf8427e");
        agent.store().upsert_schedule(entry.clone());

        assert_eq!(agent.schedule_tick(Local::now()).await.unwrap(), 0);
        let stored = agent.store().schedule().get(&entry.identity()).cloned().unwrap();
        assert_eq!(stored.state, EntryState::Error);
        assert_eq!(stored.status, Some(false));
        assert!(stored.error.is_some());
        assert_eq!(sink.schedules.lock().unwrap().len(), 1);

        // Une entrée en erreur n'est plus candidate avant d'être reprogrammée
        assert_eq!(agent.schedule_tick(Local::now()).await.unwrap(), 0);
        assert_eq!(sink.schedules.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sync_once_falls_back_to_snapshot() {
        let dir = TempDir::new().unwrap();
        let store = test_store(dir.path(), "http://localhost", Arc::default());
        let digest = place_bytes(&store, "clip.mp4", b"clip");
        let tomorrow = Local::now().date_naive() + Days::days(1);
        let mut failed = ScheduleEntry::new("1", tomorrow, "clip.mp4", digest);
        failed.state = EntryState::Error;
        let snapshot = crate::model::MachineState {
            schedule: [failed.clone()].into_iter().collect(),
            ..store.snapshot()
        };
        crate::snapshot::save(&store.snapshot_path(), &snapshot).await.unwrap();

        let sink = Arc::new(RecordingSink::default());
        let source = FixedSource(Err(MediaError::MissingArgument));
        let agent = agent(store, source, sink);

        let report = agent.sync_once().await.unwrap();
        assert_eq!(report.scheduled, 1);
        assert_eq!(report.downloaded, 0);
        assert_eq!(
            agent.store().schedule().get(&failed.identity()).unwrap().state,
            EntryState::Scheduled
        );
    }
}

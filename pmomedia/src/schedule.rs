//! Planning des diffusions
//!
//! Collection ordonnée des [`ScheduleEntry`] et de leur cycle de vie
//! (`scheduled` -> `current` -> `archived`, `error` pour une tentative ratée).

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::model::{CurrentAssignment, EntryIdentity, EntryState, ScheduleEntry};
use crate::store::MediaStore;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScheduleStore(Vec<ScheduleEntry>);

impl ScheduleStore {
    pub fn iter(&self) -> impl Iterator<Item = &ScheduleEntry> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, identity: &EntryIdentity) -> Option<&ScheduleEntry> {
        self.0.iter().find(|e| e.has_identity(identity))
    }

    /// Ajoute l'entrée ou reprend celle de même identité, état forcé à `scheduled`
    pub(crate) fn upsert(&mut self, entry: ScheduleEntry) {
        let identity = entry.identity();
        match self.0.iter_mut().find(|e| e.has_identity(&identity)) {
            Some(existing) => {
                if entry.source_url.is_some() {
                    existing.source_url = entry.source_url;
                }
                existing.state = EntryState::Scheduled;
            }
            None => {
                let mut entry = entry;
                entry.state = EntryState::Scheduled;
                self.0.push(entry);
            }
        }
    }

    /// Entrées `scheduled` ou `current` déjà actives, par date croissante
    pub fn due_entries(&self, now: &DateTime<Local>) -> Vec<&ScheduleEntry> {
        let mut due: Vec<&ScheduleEntry> = self
            .0
            .iter()
            .filter(|e| e.state.is_live() && e.is_due(now))
            .collect();
        due.sort_by_key(|e| e.from_date);
        due
    }

    /// Dernière entrée active de chaque sortie
    ///
    /// À date égale, l'entrée déclarée le plus tard l'emporte.
    pub fn promotion_candidates(&self, now: &DateTime<Local>) -> Vec<ScheduleEntry> {
        let mut latest: BTreeMap<&str, &ScheduleEntry> = BTreeMap::new();
        for entry in self.due_entries(now) {
            latest.insert(entry.display.as_str(), entry);
        }
        latest.into_values().cloned().collect()
    }

    /// Archive les entrées actives supplantées par une plus récente de la même sortie
    pub(crate) fn supersede_due(&mut self, now: &DateTime<Local>) -> usize {
        let keep: Vec<EntryIdentity> = self
            .promotion_candidates(now)
            .iter()
            .map(ScheduleEntry::identity)
            .collect();

        let mut archived = 0;
        for entry in self.0.iter_mut() {
            if entry.state.is_live()
                && entry.is_due(now)
                && !keep.iter().any(|identity| entry.has_identity(identity))
            {
                entry.state = EntryState::Archived;
                archived += 1;
            }
        }
        archived
    }

    /// Archive les entrées déjà actives correspondant à une affectation remplacée
    pub(crate) fn archive_matching(
        &mut self,
        assignment: &CurrentAssignment,
        now: &DateTime<Local>,
    ) -> usize {
        let mut archived = 0;
        for entry in self.0.iter_mut() {
            if entry.state != EntryState::Archived
                && entry.matches_assignment(assignment)
                && entry.is_due(now)
            {
                entry.state = EntryState::Archived;
                archived += 1;
            }
        }
        archived
    }

    /// Enregistre le résultat d'une tentative de promotion
    pub(crate) fn record_outcome(
        &mut self,
        identity: &EntryIdentity,
        state: EntryState,
        status: Option<bool>,
        error: Option<String>,
    ) -> Option<ScheduleEntry> {
        let entry = self.0.iter_mut().find(|e| e.has_identity(identity))?;
        entry.state = state;
        entry.status = status;
        entry.error = error;
        Some(entry.clone())
    }

    /// Entrées `scheduled` ou `error`, à (re)tenter
    pub fn pending(&self) -> Vec<ScheduleEntry> {
        self.0
            .iter()
            .filter(|e| e.state.is_pending())
            .cloned()
            .collect()
    }
}

impl FromIterator<ScheduleEntry> for ScheduleStore {
    fn from_iter<I: IntoIterator<Item = ScheduleEntry>>(iter: I) -> Self {
        ScheduleStore(iter.into_iter().collect())
    }
}

impl MediaStore {
    pub fn upsert_schedule(&self, entry: ScheduleEntry) {
        self.state().schedule.upsert(entry);
    }

    /// Archive les entrées supplantées, retourne leur nombre
    pub fn supersede_due(&self, now: &DateTime<Local>) -> usize {
        self.state().schedule.supersede_due(now)
    }

    pub fn promotion_candidates(&self, now: &DateTime<Local>) -> Vec<ScheduleEntry> {
        self.state().schedule.promotion_candidates(now)
    }

    /// Met à jour l'entrée et retourne sa nouvelle version
    pub fn record_schedule_outcome(
        &self,
        identity: &EntryIdentity,
        state: EntryState,
        status: Option<bool>,
        error: Option<String>,
    ) -> Option<ScheduleEntry> {
        self.state()
            .schedule
            .record_outcome(identity, state, status, error)
    }
}

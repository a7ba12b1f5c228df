//! Modèle de données de l'agent
//!
//! `MachineState` est l'agrégat persisté dans le snapshot. Les registres
//! qu'il contient ne se modifient que depuis la crate : les composants du
//! cycle de vie passent tous par [`crate::MediaStore`].

use chrono::{DateTime, Local, NaiveDate, TimeZone};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::PathBuf;

use crate::schedule::ScheduleStore;

/// Format des dates d'activation échangées avec le serveur (`dd.mm.yyyy`)
pub const FROM_DATE_FORMAT: &str = "%d.%m.%Y";

/// Suffixe des alias « lecture en cours » (`{display}_media.mp4`)
pub const ALIAS_SUFFIX: &str = "_media.mp4";

/// Extension des ressources vidéo
pub const MEDIA_EXTENSION: &str = "mp4";

/// Nom de l'alias d'une sortie vidéo
pub fn alias_name(display: &str) -> String {
    format!("{}{}", display, ALIAS_SUFFIX)
}

pub fn is_alias_name(name: &str) -> bool {
    name.ends_with(ALIAS_SUFFIX)
}

/// Nom de fichier conventionnel d'une ressource connue par son seul digest
pub fn default_file_name(digest: &str) -> String {
    format!("{}.{}", digest, MEDIA_EXTENSION)
}

/// Une ressource du working set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    #[serde(alias = "filename")]
    pub name: String,
    #[serde(alias = "md5hash")]
    pub digest: String,
}

impl Resource {
    pub fn new(name: impl Into<String>, digest: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            digest: digest.into(),
        }
    }
}

/// État d'une entrée de planning
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
    #[default]
    Scheduled,
    Current,
    Archived,
    Error,
}

impl EntryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryState::Scheduled => "scheduled",
            EntryState::Current => "current",
            EntryState::Archived => "archived",
            EntryState::Error => "error",
        }
    }

    /// Entrées encore candidates à une promotion
    pub fn is_live(&self) -> bool {
        matches!(self, EntryState::Scheduled | EntryState::Current)
    }

    /// Entrées en attente d'une (nouvelle) tentative
    pub fn is_pending(&self) -> bool {
        matches!(self, EntryState::Scheduled | EntryState::Error)
    }
}

/// Clé de déduplication d'une entrée de planning
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntryIdentity {
    pub digest: String,
    pub name: String,
    pub from_date: NaiveDate,
    pub display: String,
}

/// Directive « afficher `name` sur `display` à partir de `from_date` »
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    #[serde(deserialize_with = "display_from_any")]
    pub display: String,
    #[serde(alias = "from", with = "from_date_format")]
    pub from_date: NaiveDate,
    #[serde(alias = "filename")]
    pub name: String,
    #[serde(alias = "md5hash")]
    pub digest: String,
    #[serde(alias = "url", default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    #[serde(default)]
    pub state: EntryState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ScheduleEntry {
    pub fn new(
        display: impl Into<String>,
        from_date: NaiveDate,
        name: impl Into<String>,
        digest: impl Into<String>,
    ) -> Self {
        Self {
            display: display.into(),
            from_date,
            name: name.into(),
            digest: digest.into(),
            source_url: None,
            state: EntryState::Scheduled,
            status: None,
            error: None,
        }
    }

    pub fn with_source_url(mut self, url: impl Into<String>) -> Self {
        self.source_url = Some(url.into());
        self
    }

    /// Minuit local du jour `from_date`
    pub fn activation_time(&self) -> DateTime<Local> {
        local_midnight(self.from_date)
    }

    pub fn is_due(&self, now: &DateTime<Local>) -> bool {
        self.activation_time() <= *now
    }

    pub fn identity(&self) -> EntryIdentity {
        EntryIdentity {
            digest: self.digest.clone(),
            name: self.name.clone(),
            from_date: self.from_date,
            display: self.display.clone(),
        }
    }

    pub fn has_identity(&self, identity: &EntryIdentity) -> bool {
        self.digest == identity.digest
            && self.name == identity.name
            && self.from_date == identity.from_date
            && self.display == identity.display
    }

    /// Même sortie et même ressource que l'affectation
    pub fn matches_assignment(&self, assignment: &CurrentAssignment) -> bool {
        self.display == assignment.display
            && self.name == assignment.name
            && self.digest == assignment.digest
    }
}

fn local_midnight(date: NaiveDate) -> DateTime<Local> {
    let midnight = date.and_time(chrono::NaiveTime::MIN);
    match Local.from_local_datetime(&midnight).earliest() {
        Some(instant) => instant,
        // Minuit n'existe pas ce jour-là (changement d'heure)
        None => Local.from_utc_datetime(&midnight),
    }
}

/// Ressource actuellement affichée sur une sortie
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentAssignment {
    #[serde(deserialize_with = "display_from_any")]
    pub display: String,
    #[serde(alias = "filename")]
    pub name: String,
    #[serde(alias = "md5hash")]
    pub digest: String,
}

/// Environnement de l'appareil, toujours issu de la sonde au démarrage
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineInfo {
    pub serial: String,
    pub model: Option<String>,
    pub revision: Option<String>,
    pub displays: Vec<String>,
    pub service: Option<String>,
    pub working_dir: PathBuf,
    pub downloading_dir: PathBuf,
}

impl MachineInfo {
    pub fn has_display(&self, display: &str) -> bool {
        self.displays.iter().any(|d| d == display)
    }
}

/// Registre du working set (nom <-> digest), unique par nom
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkingSet(Vec<Resource>);

impl WorkingSet {
    pub fn iter(&self) -> impl Iterator<Item = &Resource> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn by_name(&self, name: &str) -> Option<&Resource> {
        self.0.iter().find(|r| r.name == name)
    }

    /// Entrée portant ce digest, alias exclus
    pub fn by_digest(&self, digest: &str) -> Option<&Resource> {
        self.0
            .iter()
            .find(|r| r.digest == digest && !is_alias_name(&r.name))
    }

    pub fn contains(&self, name: &str, digest: &str) -> bool {
        self.0.iter().any(|r| r.name == name && r.digest == digest)
    }

    pub(crate) fn upsert(&mut self, name: &str, digest: &str) {
        match self.0.iter_mut().find(|r| r.name == name) {
            Some(existing) => existing.digest = digest.to_string(),
            None => self.0.push(Resource::new(name, digest)),
        }
    }

    pub(crate) fn remove(&mut self, name: &str) -> Option<Resource> {
        let index = self.0.iter().position(|r| r.name == name)?;
        Some(self.0.remove(index))
    }
}

impl FromIterator<Resource> for WorkingSet {
    fn from_iter<I: IntoIterator<Item = Resource>>(iter: I) -> Self {
        let mut set = WorkingSet::default();
        for resource in iter {
            set.upsert(&resource.name, &resource.digest);
        }
        set
    }
}

/// Affectations courantes, au plus une par sortie
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Assignments(Vec<CurrentAssignment>);

impl Assignments {
    pub fn iter(&self) -> impl Iterator<Item = &CurrentAssignment> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn for_display(&self, display: &str) -> Option<&CurrentAssignment> {
        self.0.iter().find(|a| a.display == display)
    }

    /// Vrai si une sortie affiche cette ressource (par digest ou par nom)
    pub fn is_playing(&self, name: Option<&str>, digest: Option<&str>) -> bool {
        self.0.iter().any(|a| {
            digest.is_some_and(|d| a.digest == d) || name.is_some_and(|n| a.name == n)
        })
    }

    pub(crate) fn take_display(&mut self, display: &str) -> Option<CurrentAssignment> {
        let index = self.0.iter().position(|a| a.display == display)?;
        Some(self.0.remove(index))
    }

    pub(crate) fn assign(&mut self, assignment: CurrentAssignment) {
        self.take_display(&assignment.display);
        self.0.push(assignment);
    }

    pub(crate) fn retain(&mut self, keep: impl FnMut(&CurrentAssignment) -> bool) {
        self.0.retain(keep);
    }
}

/// Agrégat racine, unité de persistance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineState {
    pub info: MachineInfo,
    pub current: Assignments,
    pub files: WorkingSet,
    pub schedule: ScheduleStore,
}

/// Les sorties sont annoncées en texte ou en entier selon les serveurs
pub(crate) fn display_from_any<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(i64),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(text) => text,
        Raw::Number(n) => n.to_string(),
    })
}

pub(crate) fn optional_display_from_any<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(i64),
    }

    Ok(match Option::<Raw>::deserialize(deserializer)? {
        Some(Raw::Text(text)) if !text.is_empty() => Some(text),
        Some(Raw::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

pub(crate) mod from_date_format {
    use super::FROM_DATE_FORMAT;
    use chrono::NaiveDate;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(date: &NaiveDate, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&date.format(FROM_DATE_FORMAT).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<NaiveDate, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        let raw = raw.trim();
        NaiveDate::parse_from_str(raw, FROM_DATE_FORMAT)
            .or_else(|_| NaiveDate::parse_from_str(raw, "%Y-%m-%d"))
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_schedule_entry_legacy_names() {
        let entry: ScheduleEntry = serde_json::from_value(json!({
            "display": 1,
            "from": "05.03.2024",
            "filename": "abc.mp4",
            "md5hash": "abc",
            "url": "http://server/files/abc"
        }))
        .unwrap();

        assert_eq!(entry.display, "1");
        assert_eq!(entry.from_date, NaiveDate::from_ymd_opt(2024, 3, 5).unwrap());
        assert_eq!(entry.name, "abc.mp4");
        assert_eq!(entry.digest, "abc");
        assert_eq!(entry.source_url.as_deref(), Some("http://server/files/abc"));
        assert_eq!(entry.state, EntryState::Scheduled);
    }

    #[test]
    fn test_schedule_entry_serializes_current_names() {
        let entry = ScheduleEntry::new("HDMI-A-1", NaiveDate::from_ymd_opt(2024, 12, 31).unwrap(), "a.mp4", "a");
        let value = serde_json::to_value(&entry).unwrap();

        assert_eq!(value["from_date"], "31.12.2024");
        assert_eq!(value["name"], "a.mp4");
        assert_eq!(value["digest"], "a");
        assert_eq!(value["state"], "scheduled");
        assert!(value.get("source_url").is_none());
        assert!(value.get("error").is_none());
    }

    #[test]
    fn test_bad_date_is_rejected() {
        let result: Result<ScheduleEntry, _> = serde_json::from_value(json!({
            "display": "1", "from_date": "31/12/2024", "name": "a.mp4", "digest": "a"
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_activation_time_is_local_midnight() {
        let date = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let entry = ScheduleEntry::new("1", date, "a.mp4", "a");
        let activation = entry.activation_time();

        assert_eq!(activation.date_naive(), date);
        assert_eq!(activation.time(), chrono::NaiveTime::MIN);
        assert!(entry.is_due(&activation));
        assert!(!entry.is_due(&(activation - chrono::Duration::seconds(1))));
    }

    #[test]
    fn test_working_set_upsert_by_name() {
        let mut files = WorkingSet::default();
        files.upsert("a.mp4", "a");
        files.upsert("b.mp4", "b");
        files.upsert("a.mp4", "a2");

        assert_eq!(files.len(), 2);
        assert_eq!(files.by_name("a.mp4").unwrap().digest, "a2");
        assert!(files.by_digest("a").is_none());
        assert!(files.contains("b.mp4", "b"));

        assert!(files.remove("b.mp4").is_some());
        assert!(files.remove("b.mp4").is_none());
    }

    #[test]
    fn test_by_digest_skips_aliases() {
        let mut files = WorkingSet::default();
        files.upsert(&alias_name("1"), "a");
        assert!(files.by_digest("a").is_none());

        files.upsert("a.mp4", "a");
        assert_eq!(files.by_digest("a").unwrap().name, "a.mp4");
    }

    #[test]
    fn test_assignments_one_per_display() {
        let mut current = Assignments::default();
        current.assign(CurrentAssignment {
            display: "1".into(),
            name: "a.mp4".into(),
            digest: "a".into(),
        });
        current.assign(CurrentAssignment {
            display: "1".into(),
            name: "b.mp4".into(),
            digest: "b".into(),
        });

        assert_eq!(current.len(), 1);
        assert_eq!(current.for_display("1").unwrap().digest, "b");
        assert!(current.is_playing(None, Some("b")));
        assert!(current.is_playing(Some("b.mp4"), None));
        assert!(!current.is_playing(Some("a.mp4"), Some("a")));
    }
}

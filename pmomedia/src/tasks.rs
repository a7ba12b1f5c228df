//! Lots de tâches reçus du serveur de contrôle
//!
//! Le document est décodé une fois pour toutes en [`Task`] ; une tâche
//! mal formée est ignorée sans invalider le reste du lot.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::model::{optional_display_from_any, ScheduleEntry};

/// Nombre maximal d'enveloppes (`"..."`, `{"json": ...}`) retirées
const MAX_ENVELOPES: usize = 4;

/// Suppression d'une ressource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteTask {
    #[serde(alias = "filename", default)]
    pub name: Option<String>,
    #[serde(alias = "md5hash", default)]
    pub digest: Option<String>,
}

/// Affichage immédiat d'une ressource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromoteTask {
    /// Sortie visée ; absente, toutes les sorties de l'appareil
    #[serde(
        default,
        deserialize_with = "optional_display_from_any",
        skip_serializing_if = "Option::is_none"
    )]
    pub display: Option<String>,
    #[serde(alias = "md5hash")]
    pub digest: String,
    #[serde(alias = "filename", default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(alias = "source_url", default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    Delete(DeleteTask),
    Promote(PromoteTask),
    Schedule(ScheduleEntry),
}

/// Lot de tâches d'un cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskBatch {
    tasks: Vec<Task>,
}

impl TaskBatch {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self { tasks }
    }

    /// Décode un corps de réponse ; un corps illisible donne un lot vide
    pub fn from_body(body: &str) -> Self {
        match serde_json::from_str::<Value>(body) {
            Ok(value) => Self::from_value(value),
            Err(e) => {
                warn!("Task batch is not JSON: {}", e);
                Self::default()
            }
        }
    }

    /// Décode un document `{delete, current, schedule}`
    pub fn from_value(value: Value) -> Self {
        let Some(document) = unwrap_envelopes(value) else {
            warn!("Task batch is not a JSON object, ignoring it");
            return Self::default();
        };

        let mut tasks = Vec::new();
        tasks.extend(decode_list::<DeleteTask>(&document, "delete").map(Task::Delete));
        tasks.extend(decode_list::<PromoteTask>(&document, "current").map(Task::Promote));
        tasks.extend(decode_list::<ScheduleEntry>(&document, "schedule").map(Task::Schedule));
        Self { tasks }
    }

    pub fn push(&mut self, task: Task) {
        self.tasks.push(task);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn deletions(&self) -> impl Iterator<Item = &DeleteTask> {
        self.tasks.iter().filter_map(|task| match task {
            Task::Delete(delete) => Some(delete),
            _ => None,
        })
    }

    pub fn promotions(&self) -> impl Iterator<Item = &PromoteTask> {
        self.tasks.iter().filter_map(|task| match task {
            Task::Promote(promote) => Some(promote),
            _ => None,
        })
    }

    pub fn schedules(&self) -> impl Iterator<Item = &ScheduleEntry> {
        self.tasks.iter().filter_map(|task| match task {
            Task::Schedule(entry) => Some(entry),
            _ => None,
        })
    }
}

impl FromIterator<Task> for TaskBatch {
    fn from_iter<I: IntoIterator<Item = Task>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// Retire les enveloppes texte et `{"json": ...}` jusqu'à l'objet utile
fn unwrap_envelopes(mut value: Value) -> Option<serde_json::Map<String, Value>> {
    for _ in 0..MAX_ENVELOPES {
        value = match value {
            Value::String(text) => serde_json::from_str(&text).ok()?,
            Value::Object(mut map) if map.len() == 1 && map.contains_key("json") => {
                map.remove("json")?
            }
            Value::Object(map) => return Some(map),
            _ => return None,
        };
    }
    match value {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

fn decode_list<'a, T: DeserializeOwned + 'a>(
    document: &'a serde_json::Map<String, Value>,
    key: &'a str,
) -> impl Iterator<Item = T> + 'a {
    let items: &[Value] = match document.get(key) {
        Some(Value::Array(items)) => items,
        Some(Value::Null) | None => &[],
        Some(_) => {
            warn!("Task section '{}' is not a list, ignoring it", key);
            &[]
        }
    };

    items.iter().filter_map(move |item| {
        match serde_json::from_value::<T>(item.clone()) {
            Ok(task) => Some(task),
            Err(e) => {
                warn!("Skipping malformed '{}' task {}: {}", key, item, e);
                None
            }
        }
    })
}

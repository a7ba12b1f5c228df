//! Registre des verrous par ressource
//!
//! Chaque nom de fichier possède une porte binaire créée au premier usage.
//! Téléchargement, vérification, placement et suppression d'un même nom
//! passent tous par cette porte : au plus une opération en vol par nom.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Mutex as Gate, OwnedMutexGuard};

/// Porte tenue sur une ressource ; relâchée au drop.
#[derive(Debug)]
pub struct ResourceGuard {
    name: String,
    _held: OwnedMutexGuard<()>,
}

impl ResourceGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Map paresseuse nom -> porte
#[derive(Debug, Default)]
pub struct ResourceLocks {
    gates: Mutex<HashMap<String, Arc<Gate<()>>>>,
}

impl ResourceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn gates(&self) -> MutexGuard<'_, HashMap<String, Arc<Gate<()>>>> {
        self.gates.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn gate(&self, name: &str) -> Arc<Gate<()>> {
        self.gates()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Gate::new(())))
            .clone()
    }

    /// Attend que la porte `name` soit libre puis la prend
    pub async fn acquire(&self, name: &str) -> ResourceGuard {
        let gate = self.gate(name);
        let held = gate.lock_owned().await;
        tracing::trace!(name = %name, "Resource gate acquired");
        ResourceGuard {
            name: name.to_string(),
            _held: held,
        }
    }

    /// Prend la porte sans attendre, `None` si elle est déjà tenue
    pub fn try_acquire(&self, name: &str) -> Option<ResourceGuard> {
        let gate = self.gate(name);
        let held = gate.try_lock_owned().ok()?;
        Some(ResourceGuard {
            name: name.to_string(),
            _held: held,
        })
    }

    pub fn is_free(&self, name: &str) -> bool {
        match self.gates().get(name) {
            Some(gate) => gate.try_lock().is_ok(),
            None => true,
        }
    }

    /// Nombre de portes connues
    pub fn len(&self) -> usize {
        self.gates().len()
    }

    pub fn is_empty(&self) -> bool {
        self.gates().is_empty()
    }

    /// Oublie les portes ni tenues ni attendues
    ///
    /// Une porte dont la map détient la seule référence n'a ni détenteur
    /// (le guard garde un `Arc`) ni candidat (`acquire` clone l'`Arc` avant
    /// d'attendre). La map reste verrouillée pendant le balayage, aucun
    /// clone ne peut donc apparaître entre-temps.
    ///
    /// Retourne le nombre de portes supprimées.
    pub fn prune(&self) -> usize {
        let mut gates = self.gates();
        let before = gates.len();
        gates.retain(|_, gate| Arc::strong_count(gate) > 1);
        before - gates.len()
    }
}

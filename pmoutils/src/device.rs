//! Sonde matérielle de l'appareil (Raspberry Pi et assimilés).
//!
//! Les informations viennent de `/proc/cpuinfo` (numéro de série, modèle,
//! révision) et de `kmsprint` (connecteurs vidéo). Toute source absente
//! donne simplement des champs vides : la sonde ne renvoie jamais d'erreur.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Command;
use sysinfo::System;
use tracing::{debug, warn};

const CPUINFO_PATH: &str = "/proc/cpuinfo";

/// Description de l'appareil telle que rapportée au serveur de contrôle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub serial: Option<String>,
    pub model: Option<String>,
    pub revision: Option<String>,
    pub hostname: Option<String>,
    pub os: String,
    pub ip: String,
    /// Connecteurs vidéo détectés (ex: `HDMI-A-1`)
    pub displays: Vec<String>,
}

/// Interroge la machine courante.
pub fn probe_device() -> DeviceInfo {
    let mut info = match std::fs::read_to_string(Path::new(CPUINFO_PATH)) {
        Ok(content) => parse_cpuinfo(&content),
        Err(e) => {
            debug!("Unable to read {}: {}", CPUINFO_PATH, e);
            DeviceInfo::default()
        }
    };

    info.displays = match Command::new("kmsprint").output() {
        Ok(output) if output.status.success() => {
            parse_kmsprint(&String::from_utf8_lossy(&output.stdout))
        }
        Ok(output) => {
            warn!("kmsprint exited with {}", output.status);
            Vec::new()
        }
        Err(e) => {
            debug!("kmsprint unavailable: {}", e);
            Vec::new()
        }
    };

    info.hostname = System::host_name();
    info.os = crate::get_os_string();
    info.ip = crate::guess_local_ip();
    info
}

/// Extrait `Serial`, `Model` et `Revision` d'un contenu `/proc/cpuinfo`.
///
/// Sur les cartes multi-cœurs ces lignes n'apparaissent qu'une fois, après
/// les blocs `processor`.
pub fn parse_cpuinfo(content: &str) -> DeviceInfo {
    let mut info = DeviceInfo::default();

    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        match key.trim().to_lowercase().as_str() {
            "serial" => info.serial = Some(value.to_string()),
            "model" => info.model = Some(value.to_string()),
            "revision" => info.revision = Some(value.to_string()),
            _ => {}
        }
    }

    info
}

/// Liste les connecteurs d'une sortie `kmsprint`.
///
/// Une ligne de connecteur a la forme
/// `Connector 0 (32) HDMI-A-1 (connected)` : le nom est le 4e champ.
pub fn parse_kmsprint(output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|line| line.trim_start().starts_with("Connector"))
        .filter_map(|line| line.split_whitespace().nth(3))
        .map(str::to_string)
        .collect()
}

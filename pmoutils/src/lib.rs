//! Utilitaires système pour PMOSignage.
//!
//! - [`probe_device`] : numéro de série, modèle et sorties vidéo de la carte
//! - [`guess_local_ip`] : adresse IP utilisée pour les connexions sortantes
//! - [`get_os_string`] : système d'exploitation et version
mod device;
mod ip_utils;

pub use device::{DeviceInfo, parse_cpuinfo, parse_kmsprint, probe_device};
pub use ip_utils::guess_local_ip;

/// Retourne une chaîne décrivant le système d'exploitation et sa version.
///
/// # Format
/// - Linux: "Linux/6.5.0" ou "Raspbian/12"
/// - macOS: "macOS/15.1"
/// - Autre: "{OS}/Unknown"
pub fn get_os_string() -> String {
    let info = os_info::get();
    let os_type = format!("{:?}", info.os_type());

    let version = info.version();
    if version != &os_info::Version::Unknown {
        format!("{}/{}", os_type, version)
    } else {
        format!("{}/Unknown", os_type)
    }
}

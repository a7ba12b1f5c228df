use std::net::UdpSocket;

/// Devine l'adresse IP locale de la machine.
///
/// Crée un socket UDP et le "connecte" vers un serveur DNS public (8.8.8.8)
/// pour savoir quelle interface le système utiliserait pour sortir. Aucun
/// paquet n'est envoyé.
///
/// # Returns
///
/// L'adresse IP locale sous forme de `String`, ou `"127.0.0.1"` en cas d'erreur.
pub fn guess_local_ip() -> String {
    match UdpSocket::bind("0.0.0.0:0") {
        Ok(socket) => {
            if socket.connect("8.8.8.8:80").is_ok() {
                if let Ok(local_addr) = socket.local_addr() {
                    return local_addr.ip().to_string();
                }
            }
            "127.0.0.1".to_string()
        }
        Err(_) => "127.0.0.1".to_string(),
    }
}

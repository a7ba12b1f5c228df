//! Téléchargement avec reprise
//!
//! Un fichier partiel déjà présent en zone de transit est complété par une
//! requête `Range: bytes=<taille>-`. Le corps est écrit par blocs de taille
//! fixe.

use std::io;
use std::path::Path;

use futures::TryStreamExt;
use reqwest::header::{HeaderMap, CONTENT_RANGE, RANGE};
use reqwest::StatusCode;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::io::StreamReader;
use tracing::{debug, info, warn};

use crate::error::{FetchError, Result};
use crate::store::MediaStore;

impl MediaStore {
    /// Télécharge `url` dans la zone de transit sous le nom `name`
    ///
    /// La porte de la ressource est tenue pendant tout le transfert.
    pub async fn fetch(&self, url: &str, name: &str) -> Result<()> {
        let _guard = self.locks.acquire(name).await;
        let path = self.staging_path(name);
        fetch_to_file(&self.client, url, &path, self.config.download_chunk_size).await?;
        Ok(())
    }
}

/// Complète ou crée `path` à partir de `url`
///
/// - 206, ou 2xx sans reprise : écriture (ajout si reprise)
/// - 416 pendant une reprise : le fichier est déjà complet
/// - 404 : [`FetchError::NotFound`], autres 4xx/5xx : [`FetchError::RemoteError`]
/// - 2xx non partiel pendant une reprise, ou 206 dont le `Content-Range`
///   ne commence pas à la taille du fichier partiel :
///   [`FetchError::ResumeRejected`], le fichier partiel reste intact
pub async fn fetch_to_file(
    client: &reqwest::Client,
    url: &str,
    path: &Path,
    chunk_size: usize,
) -> std::result::Result<u64, FetchError> {
    let resume_offset = match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata.len(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
        Err(e) => return Err(e.into()),
    };
    let resuming = resume_offset > 0;

    debug!(url = %url, offset = resume_offset, "Requesting resource");
    let response = client
        .get(url)
        .header(RANGE, format!("bytes={}-", resume_offset))
        .send()
        .await?;
    let status = response.status();

    if resuming && status == StatusCode::RANGE_NOT_SATISFIABLE {
        info!(url = %url, "Staging copy already complete ({} bytes)", resume_offset);
        return Ok(0);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(FetchError::NotFound(url.to_string()));
    }
    if !status.is_success() {
        return Err(FetchError::RemoteError(status.as_u16()));
    }
    if resuming && status != StatusCode::PARTIAL_CONTENT {
        warn!(url = %url, "Server ignored range request, keeping partial file");
        return Err(FetchError::ResumeRejected(status.as_u16()));
    }
    if status == StatusCode::PARTIAL_CONTENT {
        let start = content_range_start(response.headers());
        if start != Some(resume_offset) {
            warn!(
                url = %url,
                "Partial content starts at {:?}, expected {}",
                start,
                resume_offset
            );
            return Err(FetchError::ResumeRejected(status.as_u16()));
        }
    }

    let mut file = if resuming {
        OpenOptions::new().append(true).open(path).await?
    } else {
        tokio::fs::File::create(path).await?
    };

    let stream = response.bytes_stream().map_err(io::Error::other);
    let mut reader = std::pin::pin!(StreamReader::new(stream));
    let mut buffer = vec![0u8; chunk_size.max(1)];
    let mut written = 0u64;

    loop {
        let read = reader.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        file.write_all(&buffer[..read]).await?;
        written += read as u64;
    }
    file.flush().await?;

    info!(
        url = %url,
        "Downloaded {} bytes to {} (resumed at {})",
        written,
        path.display(),
        resume_offset
    );
    Ok(written)
}

/// Premier octet annoncé par `Content-Range: bytes <début>-<fin>/<taille>`
fn content_range_start(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(CONTENT_RANGE)?.to_str().ok()?;
    let range = value.trim().strip_prefix("bytes ")?;
    let (start, _) = range.split_once('-')?;
    start.trim().parse().ok()
}

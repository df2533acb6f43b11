// src/fetch/mod.rs

//! Download of remote source archives ahead of staging.

use crate::config::DownloadSpec;
use crate::error::{EtlError, Result};
use crate::source::archive;
use futures_util::StreamExt;
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument};
use url::Url;

#[derive(Debug, Clone)]
pub struct Downloaded {
    pub url: String,
    pub path: PathBuf,
    pub bytes: u64,
    /// `.csv` entries written next to the archive.
    pub extracted: Vec<PathBuf>,
}

/// Last path segment of `url`, or `download.zip` when it has none.
pub fn file_name_for(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty())
        .unwrap_or("download.zip")
        .to_string()
}

/// `dest` itself when it names a file, otherwise `dest/<url file name>`.
pub fn target_path(dest: &Path, url: &Url) -> PathBuf {
    let is_dir = dest.is_dir()
        || dest.as_os_str().to_string_lossy().ends_with('/')
        || dest.extension().is_none();
    if is_dir {
        dest.join(file_name_for(url))
    } else {
        dest.to_path_buf()
    }
}

fn fetch_err(url: &str, e: impl std::fmt::Display) -> EtlError {
    EtlError::Fetch(format!("{}: {}", url, e))
}

/// Stream one download to disk, extracting `.csv` entries when asked.
#[instrument(level = "info", skip(client, spec), fields(url = %spec.url))]
pub async fn download(client: &Client, spec: &DownloadSpec) -> Result<Downloaded> {
    let url = Url::parse(&spec.url).map_err(|e| fetch_err(&spec.url, e))?;
    let path = target_path(&spec.dest, &url);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let started = Instant::now();
    let response = client
        .get(url.as_str())
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| fetch_err(&spec.url, e))?;

    let mut file = fs::File::create(&path).await?;
    let mut stream = response.bytes_stream();
    let mut bytes = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| fetch_err(&spec.url, e))?;
        file.write_all(&chunk).await?;
        bytes += chunk.len() as u64;
    }
    file.flush().await?;
    info!(path = %path.display(), bytes, elapsed = ?started.elapsed(), "downloaded");

    let extracted = if spec.extract && archive::is_zip(&path) {
        let zip_path = path.clone();
        let out_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let written = tokio::task::spawn_blocking(move || {
            archive::extract_csv_entries(&zip_path, &out_dir)
        })
        .await
        .map_err(|e| fetch_err(&spec.url, e))??;
        debug!(entries = written.len(), "extracted");
        written
    } else {
        Vec::new()
    };

    Ok(Downloaded {
        url: spec.url.clone(),
        path,
        bytes,
        extracted,
    })
}

/// Download every spec with at most `concurrency` transfers in flight.
/// Results come back in input order.
pub async fn download_all(
    client: &Client,
    specs: &[DownloadSpec],
    concurrency: usize,
) -> Vec<Result<Downloaded>> {
    let sem = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut handles = Vec::with_capacity(specs.len());

    for spec in specs {
        let client = client.clone();
        let spec = spec.clone();
        let sem = Arc::clone(&sem);
        handles.push(tokio::spawn(async move {
            let _permit = sem
                .acquire_owned()
                .await
                .map_err(|e| fetch_err(&spec.url, e))?;
            download(&client, &spec).await
        }));
    }

    let mut out = Vec::with_capacity(handles.len());
    for (handle, spec) in handles.into_iter().zip(specs) {
        let result = match handle.await {
            Ok(result) => result,
            Err(e) => Err(fetch_err(&spec.url, e)),
        };
        if let Err(e) = &result {
            error!(url = %spec.url, error = %e, "download failed");
        }
        out.push(result);
    }
    out
}

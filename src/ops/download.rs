use crate::ops::util::tmp_path_next_to;
use anyhow::Context;
use futures_util::StreamExt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

fn http_client() -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!("relay-ops/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("build http client")
}

pub async fn fetch_text(url: &str) -> anyhow::Result<String> {
    let resp = http_client()?
        .get(url)
        .send()
        .await
        .with_context(|| format!("GET {url}"))?
        .error_for_status()?;
    Ok(resp.text().await?)
}

pub async fn download_to_path(url: &str, dest: &Path) -> anyhow::Result<()> {
    let resp = http_client()?
        .get(url)
        .send()
        .await
        .with_context(|| format!("GET {url}"))?
        .error_for_status()?;
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = tmp_path_next_to(dest);
    let mut file = fs::File::create(&tmp)?;
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let buf = chunk?;
        file.write_all(&buf)?;
    }
    file.flush()?;
    fs::rename(&tmp, dest)?;
    Ok(())
}

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub fn backup_path(dest: &Path) -> PathBuf {
    let parent = dest.parent().unwrap_or_else(|| Path::new("."));
    let file = dest
        .file_name()
        .unwrap_or_else(|| std::ffi::OsStr::new("file"))
        .to_string_lossy();
    parent.join(format!("{file}.bak.{}", now_unix_secs()))
}

/// Writes `content` to `dest`, first moving a differing existing file to `<dest>.bak.<unix-secs>`.
/// Returns the backup path when one was made.
pub fn replace_file_with_backup(dest: &Path, content: &[u8]) -> anyhow::Result<Option<PathBuf>> {
    if let Ok(existing) = fs::read(dest)
        && existing == content
    {
        return Ok(None);
    }
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let staged = tmp_path_next_to(dest);
    fs::write(&staged, content)?;

    if !dest.exists() {
        fs::rename(&staged, dest)?;
        return Ok(None);
    }

    let backup = backup_path(dest);
    fs::rename(dest, &backup)?;
    match fs::rename(&staged, dest) {
        Ok(()) => Ok(Some(backup)),
        Err(e) => {
            let _ = fs::rename(&backup, dest);
            Err(e.into())
        }
    }
}

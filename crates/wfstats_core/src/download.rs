use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use reqwest::blocking::Client;

pub const DEFAULT_DUMP_BASE_URL: &str = "https://dumps.wikimedia.org/wikifunctionswiki";

pub fn dump_file_name(date: NaiveDate) -> String {
    format!(
        "wikifunctionswiki-{}-pages-meta-current.xml.bz2",
        date.format("%Y%m%d")
    )
}

pub fn dump_url(base_url: &str, date: NaiveDate) -> String {
    format!(
        "{}/{}/{}",
        base_url.trim_end_matches('/'),
        date.format("%Y%m%d"),
        dump_file_name(date)
    )
}

pub struct DumpDownloader {
    client: Client,
    base_url: String,
    data_dir: PathBuf,
}

impl DumpDownloader {
    pub fn new(base_url: &str, data_dir: &Path, user_agent: &str) -> Result<Self> {
        let client = Client::builder()
            .user_agent(user_agent.to_string())
            .connect_timeout(Duration::from_secs(30))
            .build()
            .context("failed to build download client")?;
        Ok(Self {
            client,
            base_url: base_url.to_string(),
            data_dir: data_dir.to_path_buf(),
        })
    }

    pub fn download_today(&self) -> Result<Option<PathBuf>> {
        self.download(Utc::now().date_naive())
    }

    /// Fetches the dump for `date`. A non-success response means the dump is
    /// not published (yet) and yields `Ok(None)`.
    pub fn download(&self, date: NaiveDate) -> Result<Option<PathBuf>> {
        let url = dump_url(&self.base_url, date);
        tracing::info!(%url, "downloading dump");
        let mut response = self
            .client
            .get(&url)
            .send()
            .with_context(|| format!("failed to request {url}"))?;
        if !response.status().is_success() {
            tracing::warn!(%url, status = response.status().as_u16(), "dump not available");
            return Ok(None);
        }

        fs::create_dir_all(&self.data_dir)
            .with_context(|| format!("failed to create {}", self.data_dir.display()))?;
        let target = self.data_dir.join(dump_file_name(date));
        let partial = target.with_extension("bz2.part");
        let file = File::create(&partial)
            .with_context(|| format!("failed to create {}", partial.display()))?;
        let mut writer = BufWriter::new(file);
        let bytes = response
            .copy_to(&mut writer)
            .with_context(|| format!("failed to download {url}"))?;
        writer
            .flush()
            .with_context(|| format!("failed to write {}", partial.display()))?;
        drop(writer);
        fs::rename(&partial, &target)
            .with_context(|| format!("failed to move download to {}", target.display()))?;

        tracing::info!(path = %target.display(), bytes, "dump downloaded");
        Ok(Some(target))
    }
}

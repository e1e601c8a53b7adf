//! Resolves a version identifier or URL to a server jar on disk.
use std::{
    fs::{self, File},
    io::{self, BufReader, BufWriter, Read, Write},
    path::{Path, PathBuf},
    time::SystemTime,
};

use reqwest::blocking::Client;
use serde::{Deserialize, de::DeserializeOwned};
use sha1::{Digest, Sha1};
use tracing::{debug, info, warn};

use crate::constants::{
    CACHE_DIR_NAME, HTTP_TIMEOUT, MANIFEST_CACHE_FILE_NAME, MANIFEST_CACHE_TTL, MANIFEST_URL,
    METADATA_DIR_NAME, SERVER_JAR_NAME, VERSION_DATA_FILE_NAME,
};
use crate::error::DownloadError;

/// Controls reuse of the version manifest between runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheOptions {
    /// Whether the manifest may be read from and written to `dir`.
    pub enabled: bool,
    /// Directory holding the cached manifest.
    pub dir: PathBuf,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: default_cache_dir(),
        }
    }
}

/// `$XDG_CACHE_HOME/mcsupervisor`, falling back to `~/.cache` and then the temp directory.
pub fn default_cache_dir() -> PathBuf {
    let root = std::env::var_os("XDG_CACHE_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".cache")))
        .unwrap_or_else(std::env::temp_dir);
    root.join(CACHE_DIR_NAME)
}

/// Expands a leading `~/` to the user's home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~")
        && let Some(home) = std::env::var_os("HOME")
    {
        return PathBuf::from(home).join(rest);
    }
    path.to_path_buf()
}

/// Source of server artifacts. The supervisor only ever calls this one operation.
pub trait ArtifactResolver: Send + Sync {
    /// Ensures the artifact for `version_spec` is present in `target_dir` and returns its path.
    fn fetch_server_artifact(
        &self,
        version_spec: &str,
        target_dir: &Path,
        cache: &CacheOptions,
    ) -> Result<PathBuf, DownloadError>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct VersionManifest {
    pub latest: LatestVersions,
    pub versions: Vec<VersionEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LatestVersions {
    pub release: String,
    pub snapshot: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VersionEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
    pub sha1: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VersionData {
    pub downloads: VersionDownloads,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VersionDownloads {
    pub server: DownloadInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DownloadInfo {
    pub url: String,
    pub sha1: String,
    #[serde(default)]
    pub size: Option<u64>,
}

impl VersionManifest {
    /// Resolves `latest` / `latest-snapshot` aliases and looks the version up.
    pub fn find(&self, version: &str) -> Result<&VersionEntry, DownloadError> {
        let id = match version {
            "latest" => self.latest.release.as_str(),
            "latest-snapshot" => self.latest.snapshot.as_str(),
            other => other,
        };
        self.versions
            .iter()
            .find(|entry| entry.id == id)
            .ok_or_else(|| DownloadError::UnknownVersion(version.to_string()))
    }
}

/// Returns true when `spec` is an absolute http(s) URL rather than a version id.
pub fn is_url(spec: &str) -> bool {
    let Some((scheme, rest)) = spec.split_once("://") else {
        return false;
    };
    matches!(scheme, "http" | "https")
        && rest
            .split(['/', '?', '#'])
            .next()
            .is_some_and(|host| !host.is_empty())
}

/// Writer that forwards to `inner` while hashing every byte.
struct HashingWriter<W> {
    inner: W,
    hasher: Sha1,
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.hasher.update(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn sha1_file(path: &Path) -> io::Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha1::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let read = reader.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Downloads artifacts from Mojang's piston endpoints.
pub struct MojangResolver {
    client: Client,
    manifest_url: String,
}

impl MojangResolver {
    pub fn new() -> Result<Self, DownloadError> {
        Self::with_manifest_url(MANIFEST_URL)
    }

    pub fn with_manifest_url(url: impl Into<String>) -> Result<Self, DownloadError> {
        let client = Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self {
            client,
            manifest_url: url.into(),
        })
    }

    /// Downloads `url` to `dest`, verifying the SHA-1 when `expected_sha1` is given.
    ///
    /// Content is streamed to `<dest>.part` and renamed into place only once the hash checks
    /// out; a mismatch removes the partial file and is always an error.
    pub fn fetch(
        &self,
        url: &str,
        dest: &Path,
        expected_sha1: Option<&str>,
    ) -> Result<(), DownloadError> {
        debug!("Downloading {url} to {}", dest.display());
        let mut response = self.client.get(url).send()?;
        if !response.status().is_success() {
            return Err(DownloadError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        let mut partial = dest.as_os_str().to_os_string();
        partial.push(".part");
        let partial = PathBuf::from(partial);

        let mut writer = HashingWriter {
            inner: BufWriter::new(File::create(&partial)?),
            hasher: Sha1::new(),
        };
        if let Err(err) = response.copy_to(&mut writer) {
            let _ = fs::remove_file(&partial);
            return Err(err.into());
        }
        if let Err(err) = writer.flush() {
            let _ = fs::remove_file(&partial);
            return Err(err.into());
        }

        let actual = format!("{:x}", writer.hasher.finalize());
        drop(writer.inner);

        if let Some(expected) = expected_sha1
            && !expected.eq_ignore_ascii_case(&actual)
        {
            let _ = fs::remove_file(&partial);
            return Err(DownloadError::Integrity {
                url: url.to_string(),
                expected: expected.to_string(),
                actual,
            });
        }

        fs::rename(&partial, dest)?;
        Ok(())
    }

    /// Fetches `url` and decodes the body as JSON.
    pub fn fetch_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, DownloadError> {
        let response = self.client.get(url).send()?;
        if !response.status().is_success() {
            return Err(DownloadError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }
        let bytes = response.bytes()?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn load_manifest(&self, cache: &CacheOptions) -> Result<VersionManifest, DownloadError> {
        if !cache.enabled {
            return self.fetch_json(&self.manifest_url);
        }

        let cache_dir = expand_home(&cache.dir);
        fs::create_dir_all(&cache_dir)?;
        let cached = cache_dir.join(MANIFEST_CACHE_FILE_NAME);

        let fresh = fs::metadata(&cached)
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .is_some_and(|age| age < MANIFEST_CACHE_TTL);

        if !fresh {
            match self.fetch(&self.manifest_url, &cached, None) {
                Ok(()) => debug!("Refreshed manifest cache at {}", cached.display()),
                Err(err) if cached.exists() => {
                    warn!("Failed to refresh version manifest, using stale cache: {err}");
                }
                Err(err) => return Err(err),
            }
        }

        let content = fs::read(&cached)?;
        Ok(serde_json::from_slice(&content)?)
    }
}

impl ArtifactResolver for MojangResolver {
    fn fetch_server_artifact(
        &self,
        version_spec: &str,
        target_dir: &Path,
        cache: &CacheOptions,
    ) -> Result<PathBuf, DownloadError> {
        fs::create_dir_all(target_dir)?;
        let jar_path = target_dir.join(SERVER_JAR_NAME);

        if is_url(version_spec) {
            info!("Downloading server jar from {version_spec}");
            self.fetch(version_spec, &jar_path, None)?;
            return Ok(jar_path);
        }

        let manifest = self.load_manifest(cache)?;
        let entry = manifest.find(version_spec)?;
        debug!("Resolved version '{version_spec}' to {} ({})", entry.id, entry.kind);

        let metadata_dir = target_dir.join(METADATA_DIR_NAME);
        fs::create_dir_all(&metadata_dir)?;
        let data_path = metadata_dir.join(VERSION_DATA_FILE_NAME);
        self.fetch(&entry.url, &data_path, Some(&entry.sha1))?;
        let data: VersionData = serde_json::from_slice(&fs::read(&data_path)?)?;
        let server = &data.downloads.server;

        if jar_path.is_file()
            && sha1_file(&jar_path).is_ok_and(|hash| hash.eq_ignore_ascii_case(&server.sha1))
        {
            debug!("Server jar for {} already present", entry.id);
            return Ok(jar_path);
        }

        info!("Downloading server jar for version {}", entry.id);
        self.fetch(&server.url, &jar_path, Some(&server.sha1))?;
        Ok(jar_path)
    }
}

//! Model artifact download and cache
//!
//! Model weights live in a remote model repository. At startup the edge
//! node resolves the artifact to a local file:
//!
//! ```text
//! <hub>/<repo>/resolve/main/<file>  ──download──▶  <cache>/<owner>--<name>/<file>
//! ```
//!
//! A cached artifact is reused without touching the network, so a node that
//! loaded its model once can restart while offline. Downloads land in a
//! `.part` file that is renamed into place only once complete.
//!
//! Any failure here is a startup failure reported as
//! [`InitOutcome::FailedToInit`]; it never surfaces per event.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use ripeline_core::config::ModelConfig;
use ripeline_core::{ConfigError, InitOutcome};
use thiserror::Error;

/// Model artifact resolution and loading failures
#[derive(Debug, Error)]
pub enum ModelLoadError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("download of {url} failed: {reason}")]
    Download { url: String, reason: String },

    #[error("model cache I/O: {0}")]
    Io(#[from] io::Error),

    /// The inference backend rejected the artifact
    #[error("model backend: {0}")]
    Backend(String),
}

/// A model file on local disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelArtifact {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub from_cache: bool,
}

impl ModelArtifact {
    pub fn size_mb(&self) -> f64 {
        self.size_bytes as f64 / (1024.0 * 1024.0)
    }
}

/// Resolves a repository artifact to a cached file
pub struct ModelRepository {
    config: ModelConfig,
    agent: ureq::Agent,
}

impl ModelRepository {
    pub fn new(config: ModelConfig) -> Result<Self, ModelLoadError> {
        config.validate()?;
        let agent = ureq::AgentBuilder::new()
            .user_agent(&format!("ripeline/{}", env!("CARGO_PKG_VERSION")))
            .build();
        Ok(Self { config, agent })
    }

    /// Download URL for the configured artifact
    pub fn artifact_url(&self) -> String {
        format!(
            "{}/{}/resolve/main/{}",
            self.config.hub_url.trim_end_matches('/'),
            self.config.repository,
            self.config.filename
        )
    }

    /// Local path the artifact is cached at
    pub fn cache_path(&self) -> PathBuf {
        self.config
            .cache_dir
            .join(self.config.repository.replace('/', "--"))
            .join(&self.config.filename)
    }

    /// Return the cached artifact, downloading it first if needed
    pub fn fetch(&self) -> Result<ModelArtifact, ModelLoadError> {
        let path = self.cache_path();
        if let Ok(meta) = fs::metadata(&path) {
            if meta.is_file() && meta.len() > 0 {
                log::info!("using cached model {}", path.display());
                return Ok(ModelArtifact {
                    path,
                    size_bytes: meta.len(),
                    from_cache: true,
                });
            }
        }

        let url = self.artifact_url();
        log::info!("downloading model from {url}");
        let size_bytes = self.download(&url, &path)?;
        log::info!("downloaded model to {}", path.display());

        Ok(ModelArtifact {
            path,
            size_bytes,
            from_cache: false,
        })
    }

    fn download(&self, url: &str, path: &Path) -> Result<u64, ModelLoadError> {
        let download_err = |reason: String| ModelLoadError::Download {
            url: url.to_owned(),
            reason,
        };

        let response = match self.agent.get(url).call() {
            Ok(resp) => resp,
            Err(ureq::Error::Status(code, _)) => return Err(download_err(format!("HTTP {code}"))),
            Err(ureq::Error::Transport(t)) => return Err(download_err(t.to_string())),
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let partial = path.with_extension("part");
        let mut file = File::create(&partial)?;
        let written = io::copy(&mut response.into_reader(), &mut file)?;
        file.sync_all()?;
        drop(file);

        if written == 0 {
            let _ = fs::remove_file(&partial);
            return Err(download_err("empty artifact".into()));
        }
        fs::rename(&partial, path)?;
        Ok(written)
    }
}

/// Resolve the artifact and hand it to an inference backend
///
/// `build` turns the local file into a ready model; its error becomes the
/// failure reason.
pub fn load_model<M>(
    config: &ModelConfig,
    build: impl FnOnce(&ModelArtifact) -> Result<M, ModelLoadError>,
) -> InitOutcome<M> {
    let result = ModelRepository::new(config.clone())
        .and_then(|repo| repo.fetch())
        .and_then(|artifact| {
            let model = build(&artifact)?;
            log::info!("loaded model {} ({:.1} MB)", config.repository, artifact.size_mb());
            Ok(model)
        });

    match result {
        Ok(model) => InitOutcome::Ready(model),
        Err(e) => {
            log::error!("failed to load model {}: {e}", config.repository);
            InitOutcome::failed("model", e.to_string())
        }
    }
}

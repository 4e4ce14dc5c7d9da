use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

static DATA_URI: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)^data:([^;]+);base64,(.+)$").expect("data URI pattern is valid")
});

/// Image attached to a chat command
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageAttachment {
    /// `data:<mime>;base64,<payload>`
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// Images written to disk for one invocation
#[derive(Debug, Default)]
pub struct SavedImages {
    pub dir: Option<PathBuf>,
    pub paths: Vec<PathBuf>,
}

impl SavedImages {
    /// Write each valid data URI to `<cwd>/.tmp/images/<epoch-ms>/image_<i>.<ext>`.
    /// Malformed entries are skipped.
    pub async fn persist(cwd: &Path, images: &[ImageAttachment]) -> std::io::Result<Self> {
        if images.is_empty() {
            return Ok(Self::default());
        }

        let dir = cwd
            .join(".tmp")
            .join("images")
            .join(chrono::Utc::now().timestamp_millis().to_string());
        tokio::fs::create_dir_all(&dir).await?;

        let mut paths = Vec::new();
        for (index, image) in images.iter().enumerate() {
            let Some((mime, payload)) = parse_data_uri(&image.data) else {
                warn!("Skipping image {} with invalid data URI", index);
                continue;
            };
            let bytes = match STANDARD.decode(payload.trim()) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Skipping image {}: {}", index, e);
                    continue;
                }
            };
            let extension = mime
                .split('/')
                .nth(1)
                .filter(|ext| !ext.is_empty())
                .unwrap_or("png");
            let path = dir.join(format!("image_{}.{}", index, extension));
            tokio::fs::write(&path, bytes).await?;
            paths.push(path);
        }

        info!("Saved {} attached images to {:?}", paths.len(), dir);
        Ok(Self {
            dir: Some(dir),
            paths,
        })
    }

    /// Note appended to the prompt so the CLI can find the files
    pub fn prompt_note(&self) -> Option<String> {
        if self.paths.is_empty() {
            return None;
        }
        let listing = self
            .paths
            .iter()
            .enumerate()
            .map(|(i, p)| format!("{}. {}", i + 1, p.display()))
            .collect::<Vec<_>>()
            .join("\n");
        Some(format!(
            "\n\n[Images attached: {} images available. Saved at the following paths:]\n{}",
            self.paths.len(),
            listing
        ))
    }

    /// Best-effort removal of the files and their directory
    pub async fn cleanup(&self) {
        for path in &self.paths {
            if let Err(e) = tokio::fs::remove_file(path).await {
                debug!("Failed to remove temp image {:?}: {}", path, e);
            }
        }
        if let Some(dir) = &self.dir {
            if let Err(e) = tokio::fs::remove_dir_all(dir).await {
                debug!("Failed to remove temp image dir {:?}: {}", dir, e);
            }
        }
    }
}

fn parse_data_uri(uri: &str) -> Option<(&str, &str)> {
    let captures = DATA_URI.captures(uri)?;
    let mime = captures.get(1)?.as_str();
    let payload = captures.get(2)?.as_str();
    Some((mime, payload))
}

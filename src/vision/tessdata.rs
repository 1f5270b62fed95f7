//! OCR language-data provisioning
//!
//! Tesseract needs `<lang>.traineddata` under a working `tessdata` directory. The
//! file is copied from the bundled assets (or downloaded) the first time only;
//! later calls find it present and touch nothing.

use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::ProvisionError;
use crate::vision::models::download_file;

/// What `ensure` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// At least one language file was written
    Created,
    /// Every language file was already in place; nothing was written
    AlreadyPresent,
}

/// Places language data into the working tessdata directory
#[derive(Debug, Clone)]
pub struct TessdataProvisioner {
    tessdata_dir: PathBuf,
    language: String,
    bundled_dir: Option<PathBuf>,
    download_url: Option<String>,
}

impl TessdataProvisioner {
    /// `language` may name several languages joined with `+` (e.g. "eng+deu")
    pub fn new(tessdata_dir: impl Into<PathBuf>, language: impl Into<String>) -> Self {
        Self {
            tessdata_dir: tessdata_dir.into(),
            language: language.into(),
            bundled_dir: None,
            download_url: None,
        }
    }

    /// Directory of bundled `.traineddata` assets
    pub fn with_bundled_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.bundled_dir = Some(dir.into());
        self
    }

    /// Download location; `{lang}` is replaced by the language code
    pub fn with_download_url(mut self, url: impl Into<String>) -> Self {
        self.download_url = Some(url.into());
        self
    }

    pub fn tessdata_dir(&self) -> &Path {
        &self.tessdata_dir
    }

    fn languages(&self) -> impl Iterator<Item = &str> {
        self.language.split('+').map(str::trim).filter(|l| !l.is_empty())
    }

    /// Path of the language file for one language
    pub fn traineddata_path(&self, language: &str) -> PathBuf {
        self.tessdata_dir.join(format!("{}.traineddata", language))
    }

    /// Whether every language file is present and non-empty
    pub fn is_present(&self) -> bool {
        self.languages().all(|lang| is_nonempty_file(&self.traineddata_path(lang)))
    }

    /// Make sure the language data exists, writing it at most once
    pub fn ensure(&self) -> Result<ProvisionOutcome, ProvisionError> {
        let mut outcome = ProvisionOutcome::AlreadyPresent;

        for lang in self.languages() {
            validate_language(lang)?;

            let target = self.traineddata_path(lang);
            if is_nonempty_file(&target) {
                debug!("Language data {:?} already present", target);
                continue;
            }

            std::fs::create_dir_all(&self.tessdata_dir)?;
            self.provision_one(lang, &target)?;
            outcome = ProvisionOutcome::Created;
        }

        Ok(outcome)
    }

    fn provision_one(&self, lang: &str, target: &Path) -> Result<(), ProvisionError> {
        let file_name = format!("{}.traineddata", lang);

        if let Some(bundled) = self.bundled_dir.as_ref().map(|dir| dir.join(&file_name)) {
            if is_nonempty_file(&bundled) {
                info!("Copying bundled language data {:?} to {:?}", bundled, target);
                let temp = temp_path_for(target);
                if let Err(e) = std::fs::copy(&bundled, &temp).and_then(|_| std::fs::rename(&temp, target)) {
                    let _ = std::fs::remove_file(&temp);
                    return Err(e.into());
                }
                return Ok(());
            }
        }

        if let Some(template) = &self.download_url {
            let url = template.replace("{lang}", lang);
            info!("Downloading language data for '{}' from {}", lang, url);
            download_file(&url, target).map_err(|e| ProvisionError::Download {
                url: url.clone(),
                reason: format!("{:#}", e),
            })?;
            return Ok(());
        }

        let mut searched = vec![self.tessdata_dir.display().to_string()];
        if let Some(dir) = &self.bundled_dir {
            searched.push(dir.display().to_string());
        }
        Err(ProvisionError::Missing {
            name: file_name,
            searched: searched.join(", "),
        })
    }
}

fn is_nonempty_file(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}

/// Unique sibling path so concurrent provisioners never share a partial file
fn temp_path_for(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{}.{}.part", name, uuid::Uuid::new_v4()))
}

fn validate_language(lang: &str) -> Result<(), ProvisionError> {
    let valid = lang
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(ProvisionError::Missing {
            name: format!("{}.traineddata", lang),
            searched: "invalid language code".to_string(),
        })
    }
}

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use super::guard::{TOKEN_COOKIE, TOKEN_PARAM, cookie_value, query_value, set_cookie};
use crate::context::Credential;

const CREDENTIALS_FILE: &str = "credentials";

/// The CLI's cookie jar: one `Set-Cookie` line under the state directory.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join(CREDENTIALS_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<Credential>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        Ok(content
            .lines()
            .find_map(|line| cookie_value(line, TOKEN_COOKIE))
            .and_then(Credential::new))
    }

    pub fn save(&self, credential: &Credential) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        fs::write(&self.path, format!("{}\n", set_cookie(credential.expose())))
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))
                .with_context(|| format!("Failed to restrict {}", self.path.display()))?;
        }
        Ok(())
    }

    /// Returns true when a credential was removed.
    pub fn clear(&self) -> Result<bool> {
        if !self.path.exists() {
            return Ok(false);
        }
        fs::remove_file(&self.path)
            .with_context(|| format!("Failed to remove {}", self.path.display()))?;
        Ok(true)
    }

    /// Store the `token` query parameter of a redirect URL, the way the
    /// dashboard promotes `?token=` into its cookie.
    pub fn promote_from_url(&self, raw_url: &str) -> Result<Credential> {
        let url = url::Url::parse(raw_url).with_context(|| format!("Invalid URL: {}", raw_url))?;
        let credential = url
            .query()
            .and_then(|q| query_value(q, TOKEN_PARAM))
            .and_then(Credential::new)
            .with_context(|| format!("URL has no '{}' parameter", TOKEN_PARAM))?;
        self.save(&credential)?;
        Ok(credential)
    }
}

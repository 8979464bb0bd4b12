//! OAuth token handling.
//!
//! The browser consent flow itself is bootstrapped outside the mount process;
//! this module loads the client secrets, lets the OAuth library refresh and
//! persist the token document on disk, and hands out bearer tokens.

use libremfs::config::DriveConfig;
use libremfs::storage::{Error, ErrorKind, Result};
use std::path::PathBuf;
use tracing::debug;
use yup_oauth2::authenticator::DefaultAuthenticator;
use yup_oauth2::{InstalledFlowAuthenticator, InstalledFlowReturnMethod};

/// Full drive access; refresh tokens come with the installed flow.
const SCOPES: &[&str] = &["https://www.googleapis.com/auth/drive"];

fn default_token_path() -> PathBuf {
    let home = std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    home.join(".remfs").join("gdrive-token.json")
}

/// Produces bearer tokens, refreshing and re-persisting the token document as
/// needed.
pub(crate) struct TokenSource {
    auth: DefaultAuthenticator,
}

impl std::fmt::Debug for TokenSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSource").finish()
    }
}

impl TokenSource {
    pub(crate) async fn new(config: &DriveConfig) -> Result<Self> {
        let secrets_path = config.client_secrets.clone().ok_or_else(|| {
            Error::new(
                ErrorKind::AuthFailed,
                "no Google client secrets configured; authorize the drive first",
            )
        })?;
        let secret = yup_oauth2::read_application_secret(&secrets_path)
            .await
            .map_err(|err| Error::new(ErrorKind::AuthFailed, err))?;

        let token_path = config.token_file.clone().unwrap_or_else(default_token_path);
        if let Some(parent) = token_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| Error::new(ErrorKind::Fatal, err))?;
        }
        debug!(token_path = %token_path.display(), "token persistence location");

        let auth =
            InstalledFlowAuthenticator::builder(secret, InstalledFlowReturnMethod::HTTPRedirect)
                .persist_tokens_to_disk(&token_path)
                .build()
                .await
                .map_err(|err| Error::new(ErrorKind::AuthFailed, err))?;
        Ok(TokenSource { auth })
    }

    pub(crate) async fn bearer(&self) -> Result<String> {
        let token = self
            .auth
            .token(SCOPES)
            .await
            .map_err(|err| Error::new(ErrorKind::AuthFailed, err))?;
        token
            .token()
            .map(str::to_string)
            .ok_or_else(|| Error::new(ErrorKind::AuthFailed, "token response carried no access token"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_token_path_is_user_scoped() {
        let path = default_token_path();
        assert!(path.ends_with(".remfs/gdrive-token.json"));
    }
}

//! External collaborators of a session: who the user is, and which device
//! they are on.

use std::{
    collections::HashMap,
    fmt, fs, io,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use lease_store::{AccountId, HolderInfo};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info};

/// An authenticated account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountIdentity {
    pub account_id: AccountId,
}

impl AccountIdentity {
    pub fn new(account_id: impl Into<AccountId>) -> Self {
        Self {
            account_id: account_id.into(),
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub secret: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: secret.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid credentials for {username}")]
    InvalidCredentials { username: String },
    #[error("identity provider unavailable: {0}")]
    Unavailable(String),
}

/// Identity provider. Sign-in only authenticates; the lease decides whether
/// the session may proceed.
#[async_trait]
pub trait Authenticator: Send + Sync + fmt::Debug + 'static {
    async fn authenticate(&self, credentials: &Credentials) -> Result<AccountIdentity, AuthError>;

    /// Forget the current identity. Signing out when nobody is signed in is fine.
    async fn sign_out(&self) -> Result<(), AuthError>;

    /// Current identity, updated on every sign-in and sign-out.
    fn identity_changes(&self) -> watch::Receiver<Option<AccountIdentity>>;
}

/// Authenticates against a fixed table of `username -> (secret, account)`.
#[derive(Debug)]
pub struct StaticAuthenticator {
    accounts: HashMap<String, (String, AccountId)>,
    current: watch::Sender<Option<AccountIdentity>>,
}

impl StaticAuthenticator {
    pub fn new() -> Self {
        let (current, _) = watch::channel(None);
        Self {
            accounts: HashMap::new(),
            current,
        }
    }

    pub fn with_account(
        mut self,
        username: impl Into<String>,
        secret: impl Into<String>,
        account: impl Into<AccountId>,
    ) -> Self {
        self.accounts
            .insert(username.into(), (secret.into(), account.into()));
        self
    }
}

impl Default for StaticAuthenticator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn authenticate(&self, credentials: &Credentials) -> Result<AccountIdentity, AuthError> {
        match self.accounts.get(&credentials.username) {
            Some((secret, account)) if *secret == credentials.secret => {
                let identity = AccountIdentity::new(account.clone());
                self.current.send_replace(Some(identity.clone()));
                debug!(account = %identity.account_id, "authenticated");
                Ok(identity)
            }
            _ => Err(AuthError::InvalidCredentials {
                username: credentials.username.clone(),
            }),
        }
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        self.current.send_replace(None);
        Ok(())
    }

    fn identity_changes(&self) -> watch::Receiver<Option<AccountIdentity>> {
        self.current.subscribe()
    }
}

/// Accepts any username as the account id. For operator tooling that has
/// already established who it is acting for.
#[derive(Debug)]
pub struct TrustedAuthenticator {
    current: watch::Sender<Option<AccountIdentity>>,
}

impl TrustedAuthenticator {
    pub fn new() -> Self {
        let (current, _) = watch::channel(None);
        Self { current }
    }
}

impl Default for TrustedAuthenticator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Authenticator for TrustedAuthenticator {
    async fn authenticate(&self, credentials: &Credentials) -> Result<AccountIdentity, AuthError> {
        if credentials.username.trim().is_empty() {
            return Err(AuthError::InvalidCredentials {
                username: credentials.username.clone(),
            });
        }
        let identity = AccountIdentity::new(credentials.username.as_str());
        self.current.send_replace(Some(identity.clone()));
        Ok(identity)
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        self.current.send_replace(None);
        Ok(())
    }

    fn identity_changes(&self) -> watch::Receiver<Option<AccountIdentity>> {
        self.current.subscribe()
    }
}

#[derive(Debug, Error)]
pub enum DeviceIdentityError {
    #[error("failed to read device id from {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to persist device id to {path}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Stable identifier of the device a session runs on.
pub trait DeviceIdentity: Send + Sync + fmt::Debug + 'static {
    fn holder_info(&self) -> HolderInfo;
}

/// Device id persisted to a file, generated on first use.
#[derive(Debug, Clone)]
pub struct FileDeviceIdentity {
    id: HolderInfo,
    path: PathBuf,
}

impl FileDeviceIdentity {
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self, DeviceIdentityError> {
        let path = path.as_ref().to_path_buf();
        match fs::read_to_string(&path) {
            Ok(contents) if !contents.trim().is_empty() => {
                let id = HolderInfo::new(contents.trim());
                debug!(%id, path = %path.display(), "loaded device id");
                return Ok(Self { id, path });
            }
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(source) => return Err(DeviceIdentityError::Read { path, source }),
        }

        let id = HolderInfo::new(uuid::Uuid::new_v4().to_string());
        let write = |path: &Path| -> io::Result<()> {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, format!("{id}\n"))
        };
        write(&path).map_err(|source| DeviceIdentityError::Write {
            path: path.clone(),
            source,
        })?;
        info!(%id, path = %path.display(), "generated new device id");
        Ok(Self { id, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DeviceIdentity for FileDeviceIdentity {
    fn holder_info(&self) -> HolderInfo {
        self.id.clone()
    }
}

#[derive(Debug, Clone)]
pub struct StaticDeviceIdentity(pub HolderInfo);

impl StaticDeviceIdentity {
    pub fn new(id: impl Into<HolderInfo>) -> Self {
        Self(id.into())
    }
}

impl DeviceIdentity for StaticDeviceIdentity {
    fn holder_info(&self) -> HolderInfo {
        self.0.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("session-core-{name}-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn test_static_authenticator() {
        let auth = StaticAuthenticator::new().with_account("alice", "hunter2", "acct-1");
        let mut changes = auth.identity_changes();

        let err = auth
            .authenticate(&Credentials::new("alice", "wrong"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials { .. }));

        let identity = auth
            .authenticate(&Credentials::new("alice", "hunter2"))
            .await
            .unwrap();
        assert_eq!(identity.account_id.as_str(), "acct-1");
        changes.changed().await.unwrap();
        assert_eq!(changes.borrow_and_update().as_ref(), Some(&identity));

        auth.sign_out().await.unwrap();
        changes.changed().await.unwrap();
        assert!(changes.borrow().is_none());
    }

    #[tokio::test]
    async fn test_trusted_authenticator_rejects_blank_username() {
        let auth = TrustedAuthenticator::new();
        assert!(auth.authenticate(&Credentials::new("  ", "")).await.is_err());
        let identity = auth.authenticate(&Credentials::new("bob", "")).await.unwrap();
        assert_eq!(identity.account_id.as_str(), "bob");
    }

    #[test]
    fn test_credentials_debug_hides_secret() {
        let dbg = format!("{:?}", Credentials::new("alice", "hunter2"));
        assert!(dbg.contains("alice"));
        assert!(!dbg.contains("hunter2"));
    }

    #[test]
    fn test_device_id_is_stable_across_loads() {
        let dir = scratch_dir("device");
        let path = dir.join("nested").join("device-id");

        let first = FileDeviceIdentity::load_or_create(&path).unwrap();
        let second = FileDeviceIdentity::load_or_create(&path).unwrap();
        assert_eq!(first.holder_info(), second.holder_info());
        assert_eq!(second.path(), path.as_path());

        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_empty_device_file_is_regenerated() {
        let dir = scratch_dir("empty");
        let path = dir.join("device-id");
        fs::write(&path, "\n").unwrap();

        let identity = FileDeviceIdentity::load_or_create(&path).unwrap();
        assert!(!identity.holder_info().as_str().is_empty());
        assert_eq!(
            fs::read_to_string(&path).unwrap().trim(),
            identity.holder_info().as_str()
        );

        fs::remove_dir_all(dir).unwrap();
    }
}

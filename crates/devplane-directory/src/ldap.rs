//! Directory client used by the bootstrap
//!
//! Only adds are needed. "Already exists" (result code 68) is an outcome,
//! not an error, so re-running the bootstrap against a seeded server is a
//! no-op.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use ldap3::{Ldap, LdapConnAsync, LdapConnSettings, LdapResult};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::error::DirectoryError;
use crate::seed::DirectoryEntry;

/// LDAP `entryAlreadyExists`
pub const RC_ALREADY_EXISTS: u32 = 68;

const RC_SUCCESS: u32 = 0;

/// Result of adding one entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOutcome {
    /// The server added the entry
    Created,
    /// The DN was already present; nothing changed
    AlreadyExists,
}

/// Writes schema and data entries
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DirectoryClient: Send + Sync {
    /// Add a schema entry under the server's config tree
    async fn add_schema(&self, schema: &DirectoryEntry) -> Result<EntryOutcome, DirectoryError>;

    /// Add a data entry
    async fn add_entry(&self, entry: &DirectoryEntry) -> Result<EntryOutcome, DirectoryError>;
}

/// Connection parameters for [`LdapDirectory`]
#[derive(Debug, Clone)]
pub struct LdapSettings {
    /// `ldap://` or `ldaps://` URL
    pub url: String,
    /// DN bound for data entries
    pub bind_dn: String,
    /// Password for `bind_dn`
    pub bind_password: String,
    /// DN bound for schema entries; falls back to `bind_dn`
    pub config_bind_dn: Option<String>,
    /// Password for `config_bind_dn`; falls back to `bind_password`
    pub config_bind_password: Option<String>,
    /// Per-operation timeout
    pub timeout: Duration,
}

/// [`DirectoryClient`] over `ldap3`.
///
/// Connections are opened on first use, so the client can be built before the
/// server is up. A failed operation drops its connection and the next call
/// reconnects.
pub struct LdapDirectory {
    settings: LdapSettings,
    data: Mutex<Option<Ldap>>,
    config: Mutex<Option<Ldap>>,
}

impl LdapDirectory {
    /// Client that connects lazily with `settings`
    pub fn new(settings: LdapSettings) -> Self {
        Self {
            settings,
            data: Mutex::new(None),
            config: Mutex::new(None),
        }
    }

    async fn connect(&self, bind_dn: &str, password: &str) -> Result<Ldap, DirectoryError> {
        let url = &self.settings.url;
        let conn_settings = LdapConnSettings::new().set_conn_timeout(self.settings.timeout);
        let (conn, mut ldap) = LdapConnAsync::with_settings(conn_settings, url)
            .await
            .map_err(|e| DirectoryError::Connect {
                url: url.clone(),
                message: e.to_string(),
            })?;

        let driver_url = url.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.drive().await {
                warn!(url = %driver_url, error = %e, "ldap connection closed with error");
            }
        });

        ldap.with_timeout(self.settings.timeout);
        let result = ldap
            .simple_bind(bind_dn, password)
            .await
            .map_err(|e| DirectoryError::Connect {
                url: url.clone(),
                message: e.to_string(),
            })?;
        if result.rc != RC_SUCCESS {
            return Err(DirectoryError::Operation {
                operation: "bind",
                dn: bind_dn.to_string(),
                code: result.rc,
                message: result.text,
            });
        }

        info!(url = %url, bind_dn, "connected to directory");
        Ok(ldap)
    }

    async fn add_with(
        &self,
        slot: &Mutex<Option<Ldap>>,
        bind_dn: &str,
        password: &str,
        entry: &DirectoryEntry,
    ) -> Result<EntryOutcome, DirectoryError> {
        let mut guard = slot.lock().await;
        let mut ldap = match guard.take() {
            Some(ldap) => ldap,
            None => self.connect(bind_dn, password).await?,
        };

        let attrs: Vec<(&str, HashSet<&str>)> = entry
            .attributes
            .iter()
            .map(|(name, values)| (name.as_str(), values.iter().map(String::as_str).collect()))
            .collect();

        match ldap.add(&entry.dn, attrs).await {
            Ok(result) => {
                *guard = Some(ldap);
                classify_add(&entry.dn, result)
            }
            Err(e) => Err(DirectoryError::Connect {
                url: self.settings.url.clone(),
                message: e.to_string(),
            }),
        }
    }
}

fn classify_add(dn: &str, result: LdapResult) -> Result<EntryOutcome, DirectoryError> {
    match result.rc {
        RC_SUCCESS => {
            debug!(dn, "entry created");
            Ok(EntryOutcome::Created)
        }
        RC_ALREADY_EXISTS => {
            debug!(dn, "entry already exists");
            Ok(EntryOutcome::AlreadyExists)
        }
        code => Err(DirectoryError::Operation {
            operation: "add",
            dn: dn.to_string(),
            code,
            message: result.text,
        }),
    }
}

#[async_trait]
impl DirectoryClient for LdapDirectory {
    async fn add_schema(&self, schema: &DirectoryEntry) -> Result<EntryOutcome, DirectoryError> {
        let dn = self
            .settings
            .config_bind_dn
            .as_deref()
            .unwrap_or(&self.settings.bind_dn);
        let password = self
            .settings
            .config_bind_password
            .as_deref()
            .unwrap_or(&self.settings.bind_password);
        self.add_with(&self.config, dn, password, schema).await
    }

    async fn add_entry(&self, entry: &DirectoryEntry) -> Result<EntryOutcome, DirectoryError> {
        self.add_with(
            &self.data,
            &self.settings.bind_dn,
            &self.settings.bind_password,
            entry,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(rc: u32, text: &str) -> LdapResult {
        LdapResult {
            rc,
            matched: String::new(),
            text: text.to_string(),
            refs: Vec::new(),
            ctrls: Vec::new(),
        }
    }

    #[test]
    fn result_codes_map_to_outcomes() {
        let dn = "ou=people,dc=devplane,dc=local";
        assert_eq!(classify_add(dn, result(0, "")).unwrap(), EntryOutcome::Created);
        assert_eq!(
            classify_add(dn, result(68, "Already exists")).unwrap(),
            EntryOutcome::AlreadyExists
        );

        match classify_add(dn, result(32, "No such object")) {
            Err(DirectoryError::Operation { code, dn: failed, .. }) => {
                assert_eq!(code, 32);
                assert_eq!(failed, dn);
            }
            other => panic!("expected operation error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unreachable_server_is_a_connect_error() {
        let dir = LdapDirectory::new(LdapSettings {
            url: "ldap://127.0.0.1:1".to_string(),
            bind_dn: "cn=admin,dc=devplane,dc=local".to_string(),
            bind_password: "secret".to_string(),
            config_bind_dn: None,
            config_bind_password: None,
            timeout: Duration::from_millis(500),
        });
        let entry = DirectoryEntry {
            dn: "ou=people,dc=devplane,dc=local".to_string(),
            attributes: Default::default(),
        };
        let err = dir.add_entry(&entry).await.unwrap_err();
        assert!(matches!(err, DirectoryError::Connect { .. }));
        assert!(err.is_retryable());
    }
}

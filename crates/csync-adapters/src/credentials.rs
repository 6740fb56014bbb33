use std::collections::HashMap;

use csync_core::Credentials;

use crate::AdapterError;

pub const DEFAULT_API_VERSION: &str = "4.1";

/// Source of supplier account secrets. Account management lives elsewhere;
/// this only resolves what a run needs.
pub trait CredentialProvider: Send + Sync {
    fn get_credentials(&self, supplier: &str, account: &str) -> Result<Credentials, AdapterError>;
}

/// Reads `CSYNC_CRED_<SUPPLIER>_<ACCOUNT>_<FIELD>` variables.
///
/// The credential kind follows from which fields are present: `KEY` (with
/// optional `VERSION`) gives an API key, `ID` + `SECRET` a signed pair and
/// `USERNAME` + `PASSWORD` a login.
pub struct EnvCredentialProvider {
    lookup: Box<dyn Fn(&str) -> Option<String> + Send + Sync>,
}

impl Default for EnvCredentialProvider {
    fn default() -> Self {
        Self::with_lookup(|name| std::env::var(name).ok())
    }
}

impl EnvCredentialProvider {
    pub fn with_lookup(lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
        Self {
            lookup: Box::new(lookup),
        }
    }

    pub fn var_name(supplier: &str, account: &str, field: &str) -> String {
        format!(
            "CSYNC_CRED_{}_{}_{}",
            env_segment(supplier),
            env_segment(account),
            field
        )
    }

    fn field(&self, supplier: &str, account: &str, field: &str) -> Option<String> {
        (self.lookup)(&Self::var_name(supplier, account, field)).filter(|v| !v.trim().is_empty())
    }
}

fn env_segment(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

impl CredentialProvider for EnvCredentialProvider {
    fn get_credentials(&self, supplier: &str, account: &str) -> Result<Credentials, AdapterError> {
        if let Some(key) = self.field(supplier, account, "KEY") {
            let version = self
                .field(supplier, account, "VERSION")
                .unwrap_or_else(|| DEFAULT_API_VERSION.to_string());
            return Ok(Credentials::ApiKey { key, version });
        }
        if let (Some(id), Some(secret)) = (
            self.field(supplier, account, "ID"),
            self.field(supplier, account, "SECRET"),
        ) {
            return Ok(Credentials::Signed { id, secret });
        }
        if let (Some(username), Some(password)) = (
            self.field(supplier, account, "USERNAME"),
            self.field(supplier, account, "PASSWORD"),
        ) {
            return Ok(Credentials::Login { username, password });
        }
        Err(AdapterError::Credentials(format!(
            "no credentials for {supplier}/{account} (expected {}*)",
            Self::var_name(supplier, account, "")
        )))
    }
}

/// Fixed credential map, for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentialProvider {
    entries: HashMap<(String, String), Credentials>,
}

impl StaticCredentialProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, supplier: &str, account: &str, credentials: Credentials) -> Self {
        self.entries
            .insert((supplier.to_string(), account.to_string()), credentials);
        self
    }
}

impl CredentialProvider for StaticCredentialProvider {
    fn get_credentials(&self, supplier: &str, account: &str) -> Result<Credentials, AdapterError> {
        self.entries
            .get(&(supplier.to_string(), account.to_string()))
            .cloned()
            .ok_or_else(|| AdapterError::Credentials(format!("no credentials for {supplier}/{account}")))
    }
}

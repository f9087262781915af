//! Credential identity, the throttler cache key.

use crate::config::CredentialsConfig;
use crate::{Error, ErrorContext, Result};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;

/// Parameter naming the credentials type in a host-supplied parameter map.
pub const PARAM_CREDENTIALS_TYPE: &str = "credentialsType";
pub const PARAM_ENVIRONMENT: &str = "environment";
pub const PARAM_SUBSCRIPTION_ID: &str = "subscriptionId";
pub const PARAM_CLIENT_ID: &str = "clientId";
pub const PARAM_TENANT_ID: &str = "tenantId";
pub const PARAM_CLIENT_SECRET: &str = "clientSecret";

/// Immutable identity of one provider account. Equal iff every field is equal.
///
/// `Debug` and [`fingerprint`](Self::fingerprint) never expose the secret.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum CredentialIdentity {
    /// Managed identity in a named cloud environment.
    Environment {
        environment: String,
        subscription_id: String,
    },
    /// Application credentials.
    Application {
        client_id: String,
        tenant_id: String,
        secret: String,
        subscription_id: String,
    },
}

impl CredentialIdentity {
    pub fn environment(environment: impl Into<String>, subscription_id: impl Into<String>) -> Self {
        CredentialIdentity::Environment {
            environment: environment.into(),
            subscription_id: subscription_id.into(),
        }
    }

    pub fn application(
        client_id: impl Into<String>,
        tenant_id: impl Into<String>,
        secret: impl Into<String>,
        subscription_id: impl Into<String>,
    ) -> Self {
        CredentialIdentity::Application {
            client_id: client_id.into(),
            tenant_id: tenant_id.into(),
            secret: secret.into(),
            subscription_id: subscription_id.into(),
        }
    }

    /// Resolves a host parameter map, dispatching once on `credentialsType`.
    ///
    /// `msi` (or a missing type) selects the environment identity, `credentials` and
    /// `service` select application credentials.
    pub fn from_params(params: &HashMap<String, String>) -> Result<Self> {
        let get = |key: &str| params.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());
        let require = |key: &str| {
            get(key).map(str::to_string).ok_or_else(|| {
                Error::configuration(format!("missing credential parameter `{}`", key)).with_context(
                    ErrorContext::new()
                        .with_resource(key.to_string())
                        .with_source("throttler_cache"),
                )
            })
        };

        match get(PARAM_CREDENTIALS_TYPE).map(str::to_ascii_lowercase).as_deref() {
            None | Some("msi") => Ok(Self::environment(
                get(PARAM_ENVIRONMENT).unwrap_or("AZURE"),
                require(PARAM_SUBSCRIPTION_ID)?,
            )),
            Some("credentials") | Some("service") => Ok(Self::application(
                require(PARAM_CLIENT_ID)?,
                require(PARAM_TENANT_ID)?,
                require(PARAM_CLIENT_SECRET)?,
                require(PARAM_SUBSCRIPTION_ID)?,
            )),
            Some(other) => Err(Error::configuration(format!(
                "unknown credentials type `{}`",
                other
            ))
            .with_context(
                ErrorContext::new()
                    .with_resource(PARAM_CREDENTIALS_TYPE)
                    .with_source("throttler_cache"),
            )),
        }
    }

    pub fn subscription_id(&self) -> &str {
        match self {
            CredentialIdentity::Environment {
                subscription_id, ..
            }
            | CredentialIdentity::Application {
                subscription_id, ..
            } => subscription_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CredentialIdentity::Environment { .. } => "msi",
            CredentialIdentity::Application { .. } => "credentials",
        }
    }

    /// Short SHA-256 digest over every field, safe to log.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        match self {
            CredentialIdentity::Environment {
                environment,
                subscription_id,
            } => {
                hasher.update(b"env\0");
                hasher.update(environment.as_bytes());
                hasher.update(b"\0");
                hasher.update(subscription_id.as_bytes());
            }
            CredentialIdentity::Application {
                client_id,
                tenant_id,
                secret,
                subscription_id,
            } => {
                hasher.update(b"app\0");
                for part in [client_id, tenant_id, secret, subscription_id] {
                    hasher.update(part.as_bytes());
                    hasher.update(b"\0");
                }
            }
        }
        hasher.finalize()[..6]
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }

    /// Label used for logs and the throttler name.
    pub fn label(&self) -> String {
        format!("{}:{}", self.kind(), self.fingerprint())
    }
}

impl fmt::Debug for CredentialIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialIdentity::Environment {
                environment,
                subscription_id,
            } => f
                .debug_struct("Environment")
                .field("environment", environment)
                .field("subscription_id", subscription_id)
                .finish(),
            CredentialIdentity::Application {
                client_id,
                tenant_id,
                subscription_id,
                ..
            } => f
                .debug_struct("Application")
                .field("client_id", client_id)
                .field("tenant_id", tenant_id)
                .field("secret", &"<redacted>")
                .field("subscription_id", subscription_id)
                .finish(),
        }
    }
}

impl From<&CredentialsConfig> for CredentialIdentity {
    fn from(config: &CredentialsConfig) -> Self {
        match config {
            CredentialsConfig::Msi {
                environment,
                subscription_id,
            } => Self::environment(environment.clone(), subscription_id.clone()),
            CredentialsConfig::Credentials {
                client_id,
                tenant_id,
                secret,
                subscription_id,
            } => Self::application(
                client_id.clone(),
                tenant_id.clone(),
                secret.clone(),
                subscription_id.clone(),
            ),
        }
    }
}

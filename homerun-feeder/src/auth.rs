//! Authorization code supply.
//!
//! The login frame carries an authorization code issued by the Homerun
//! account service. Fetching it over HTTP is the host's business; the client
//! only needs something that hands over the string once at startup.

use std::env;

use async_trait::async_trait;

use crate::error::{FeederError, FeederResult};

/// Environment variable holding the authorization code.
pub const AUTHORIZE_CODE_VAR: &str = "HOMERUN_AUTHORIZE_CODE";

/// Source of the opaque authorization code used as the login credential.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Obtain the authorization code.
    async fn authorize_code(&self) -> FeederResult<String>;
}

/// A code known up front.
#[derive(Debug, Clone)]
pub struct StaticCredentials(pub String);

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn authorize_code(&self) -> FeederResult<String> {
        Ok(self.0.clone())
    }
}

/// Reads the code from [`AUTHORIZE_CODE_VAR`].
#[derive(Debug, Clone, Default)]
pub struct EnvCredentials;

#[async_trait]
impl CredentialProvider for EnvCredentials {
    async fn authorize_code(&self) -> FeederResult<String> {
        let code = env::var(AUTHORIZE_CODE_VAR)
            .map_err(|_| FeederError::MissingCredential(format!("{} not set", AUTHORIZE_CODE_VAR)))?;

        let code = code.trim();
        if code.is_empty() {
            return Err(FeederError::MissingCredential(format!(
                "{} is empty",
                AUTHORIZE_CODE_VAR
            )));
        }

        Ok(code.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_credentials() {
        let provider = StaticCredentials("abc".to_string());
        assert_eq!(provider.authorize_code().await.unwrap(), "abc");
    }
}

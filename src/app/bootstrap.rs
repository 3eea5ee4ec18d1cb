//! Usage: Builds a running `OAuth2Service` from `ServiceSettings`.

use crate::dispatch::executor::TaskExecutor;
use crate::dispatch::service::{OAuth2Service, ServiceBootstrap};
use crate::domain::grant::AccessGrant;
use crate::gateway::oauth::client::{HttpOAuth2Client, OAuth2Client};
use crate::gateway::oauth::token_exchange::TokenEndpoint;
use crate::infra::credential_storage::{
    CredentialStorage, MemoryCredentialStorage, SqliteCredentialStorage,
};
use crate::infra::settings::ServiceSettings;
use crate::shared::error::AppResult;
use std::sync::Arc;

/// Token endpoint client from settings; starts with a blank grant until the first login.
#[derive(Debug, Clone)]
pub struct SettingsBootstrap {
    endpoint: TokenEndpoint,
    initial_grant: AccessGrant,
}

impl SettingsBootstrap {
    pub fn new(settings: &ServiceSettings) -> Self {
        Self {
            endpoint: TokenEndpoint {
                token_uri: settings.token_uri.clone(),
                client_id: settings.client_id.clone(),
                client_secret: settings.client_secret.clone(),
                scope: settings.scope.clone(),
            },
            initial_grant: AccessGrant::blank(),
        }
    }

    /// Seeds the store, e.g. with a refresh token obtained out of band.
    pub fn with_initial_grant(mut self, grant: AccessGrant) -> Self {
        self.initial_grant = grant;
        self
    }
}

impl ServiceBootstrap for SettingsBootstrap {
    fn create_oauth2_client(&self) -> AppResult<Arc<dyn OAuth2Client>> {
        Ok(Arc::new(HttpOAuth2Client::new(self.endpoint.clone())?))
    }

    fn create_access_grant(&self) -> AccessGrant {
        self.initial_grant.clone()
    }
}

pub fn open_credential_storage(settings: &ServiceSettings) -> AppResult<Arc<dyn CredentialStorage>> {
    match settings.credential_db_path.as_deref() {
        Some(path) => Ok(Arc::new(SqliteCredentialStorage::open(path)?)),
        None => Ok(Arc::new(MemoryCredentialStorage::new())),
    }
}

/// Must be called from within a tokio runtime.
pub fn start_service(
    settings: &ServiceSettings,
    bootstrap: &dyn ServiceBootstrap,
) -> AppResult<OAuth2Service> {
    let storage = open_credential_storage(settings)?;
    let executor = TaskExecutor::new(settings.worker_count as usize);
    OAuth2Service::start(executor, bootstrap, storage, settings.retry_settings())
}

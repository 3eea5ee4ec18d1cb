//! Usage: OAuth2 token-refresh coordination for an asynchronous request executor.
//!
//! Requests that send the shared access grant are retried after a single, shared token refresh
//! when they fail with 401. Login and refresh results replace the grant for every in-flight
//! request.

pub mod app;
pub mod credential;
pub mod dispatch;
pub mod domain;
pub mod gateway;
pub mod infra;
pub mod shared;
pub mod test_support;

pub use credential::store::{CredentialSnapshot, CredentialStore};
pub use dispatch::executor::{ExecutionService, RequestHandle, TaskExecutor};
pub use dispatch::request::{ConsumesCredential, ProducesCredential, Request, RequestListener};
pub use dispatch::retry::{RetryDecision, RetryPolicy, RetrySettings};
pub use dispatch::service::{OAuth2Service, ServiceBootstrap};
pub use domain::grant::AccessGrant;
pub use gateway::bearer_request::BearerRequest;
pub use gateway::oauth::client::{HttpOAuth2Client, OAuth2Client};
pub use gateway::transport::{build_auth_header, ReqwestTransport, Transport};
pub use infra::credential_storage::CredentialStorage;
pub use infra::settings::ServiceSettings;
pub use shared::error::{AppError, AppResult, RequestError};

//! Usage: Request contract for the execution service plus the credential capability traits
//! the dispatcher classifies requests by.

use crate::credential::registry::GrantBinding;
use crate::credential::store::CredentialSnapshot;
use crate::domain::grant::AccessGrant;
use crate::shared::error::RequestError;
use crate::shared::BoxFuture;

/// One unit of asynchronous work. `execute_network_call` may run several times when a retry
/// policy asks for it; each call is one attempt.
pub trait Request: Send + Sync + 'static {
    type Output: Send + 'static;

    fn execute_network_call(&self) -> BoxFuture<'_, Result<Self::Output, RequestError>>;

    /// Short name used in logs.
    fn label(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// `Some` for requests that send the shared access grant.
    fn as_credential_consumer(&self) -> Option<&dyn ConsumesCredential> {
        None
    }

    /// `Some` for requests whose successful output is a new access grant.
    fn as_credential_producer(&self) -> Option<&dyn ProducesCredential<Self::Output>> {
        None
    }
}

/// A request authenticated with the shared grant.
///
/// Read the grant for a network attempt through `grant_for_attempt`, once per attempt, so a
/// 401 is matched against the generation that was actually sent.
pub trait ConsumesCredential: Send + Sync {
    fn grant_binding(&self) -> &GrantBinding;

    fn grant_for_attempt(&self) -> Option<CredentialSnapshot> {
        self.grant_binding().begin_attempt()
    }

    /// Returns `false` when the request already holds the same or a newer grant.
    fn set_access_grant(&self, snapshot: &CredentialSnapshot) -> bool {
        self.grant_binding().bind(snapshot)
    }
}

/// A credential-exchange request (login, refresh).
pub trait ProducesCredential<T>: Send + Sync {
    fn produced_grant(&self, output: &T) -> AccessGrant;
}

/// Terminal-outcome callbacks. Exactly one of the two is called per submission.
pub trait RequestListener<T>: Send + Sync {
    fn on_request_success(&self, output: &T);

    fn on_request_failure(&self, error: &RequestError);
}

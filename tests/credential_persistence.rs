use oauth_relay_lib::gateway::transport::Transport;
use oauth_relay_lib::infra::credential_storage::SqliteCredentialStorage;
use oauth_relay_lib::test_support::{
    grant, start_service_with_storage, FakeOAuth2Client, ScriptedTransport,
};
use oauth_relay_lib::{AccessGrant, BearerRequest, CredentialStorage, RetrySettings};
use serde_json::Value;
use std::sync::Arc;

fn open(dir: &tempfile::TempDir) -> Arc<dyn CredentialStorage> {
    Arc::new(SqliteCredentialStorage::open(&dir.path().join("grants.db")).expect("open storage"))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn refreshed_grant_survives_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let transport = ScriptedTransport::accepting("fresh");
    let client = Arc::new(FakeOAuth2Client::refreshing_to(grant("fresh", "r-2")));

    {
        let service = start_service_with_storage(
            client.clone(),
            grant("stale", "r-1"),
            RetrySettings::default(),
            open(&dir),
        )
        .expect("service");
        let transport: Arc<dyn Transport> = transport.clone();
        service
            .execute(BearerRequest::<Value>::get(transport, "https://api.example.test/me"))
            .await
            .expect("request succeeds");
    }

    let storage = open(&dir);
    let persisted = storage.load().expect("load").expect("grant persisted");
    assert_eq!(persisted.access_token(), "fresh");
    assert_eq!(persisted.refresh_token(), "r-2");

    // The persisted grant wins over the bootstrap default.
    let service = start_service_with_storage(
        client,
        AccessGrant::blank(),
        RetrySettings::default(),
        storage,
    )
    .expect("service");
    assert_eq!(service.current_grant().access_token(), "fresh");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_storage_falls_back_to_bootstrap_grant() {
    let dir = tempfile::tempdir().expect("tempdir");
    let client = Arc::new(FakeOAuth2Client::refreshing_to(grant("unused", "r")));

    let service = start_service_with_storage(
        client,
        grant("seed", "r-seed"),
        RetrySettings::default(),
        open(&dir),
    )
    .expect("service");

    assert_eq!(service.current_grant().access_token(), "seed");
    assert_eq!(service.current_snapshot().generation, 1);
}

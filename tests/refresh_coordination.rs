use oauth_relay_lib::credential::registry::GrantBinding;
use oauth_relay_lib::gateway::transport::{HttpCall, Transport};
use oauth_relay_lib::shared::BoxFuture;
use oauth_relay_lib::test_support::{
    grant, start_service, start_service_with_storage, FakeOAuth2Client, ScriptedTransport,
};
use oauth_relay_lib::{
    build_auth_header, AccessGrant, AppResult, BearerRequest, ConsumesCredential,
    CredentialStorage, OAuth2Client, Request, RequestError, RetrySettings,
};
use reqwest::Method;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const URL: &str = "https://api.example.test/items";

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

fn get(transport: &Arc<ScriptedTransport>) -> BearerRequest<Value> {
    let transport: Arc<dyn Transport> = transport.clone();
    BearerRequest::get(transport, URL)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_401_refreshes_once_and_retries_with_new_token() {
    let transport = ScriptedTransport::accepting("fresh");
    let client = Arc::new(FakeOAuth2Client::refreshing_to(grant("fresh", "r-2")));
    let service = start_service(client.clone(), grant("stale", "r-1"), RetrySettings::default())
        .expect("service");

    let body = service.execute(get(&transport)).await.expect("request succeeds");

    assert_eq!(body["token"], "fresh");
    assert_eq!(transport.calls(), 2);
    assert_eq!(transport.tokens_seen(), vec!["stale", "fresh"]);
    assert_eq!(client.refresh_calls(), 1);
    assert_eq!(client.refresh_tokens_seen(), vec!["r-1"]);
    assert_eq!(service.current_grant().access_token(), "fresh");
    assert!(service.registry().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_401s_share_exactly_one_refresh() {
    let transport = ScriptedTransport::accepting("fresh");
    let client = Arc::new(
        FakeOAuth2Client::refreshing_to(grant("fresh", "r-2"))
            .with_latency(Duration::from_millis(100)),
    );
    let service = start_service(client.clone(), grant("stale", "r-1"), RetrySettings::default())
        .expect("service");

    let handles: Vec<_> = (0..8)
        .map(|_| service.submit(get(&transport), Vec::new()))
        .collect();
    for handle in handles {
        let body = handle.outcome().await.expect("request succeeds");
        assert_eq!(body["token"], "fresh");
    }

    assert_eq!(client.refresh_calls(), 1);
    assert_eq!(service.refresh_gate().refreshes_launched(), 1);
    assert!(transport.calls() <= 16);
    assert!(service.registry().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn request_failing_during_refresh_joins_it() {
    let transport = ScriptedTransport::accepting("fresh");
    let client = Arc::new(
        FakeOAuth2Client::refreshing_to(grant("fresh", "r-2"))
            .with_latency(Duration::from_millis(200)),
    );
    let service = start_service(client.clone(), grant("stale", "r-1"), RetrySettings::default())
        .expect("service");

    let first = service.submit(get(&transport), Vec::new());
    wait_until(|| service.refresh_gate().is_in_flight()).await;

    let second = service.submit(get(&transport), Vec::new());

    assert_eq!(first.outcome().await.expect("first")["token"], "fresh");
    assert_eq!(second.outcome().await.expect("second")["token"], "fresh");
    assert_eq!(client.refresh_calls(), 1);
    assert_eq!(transport.calls(), 4);
    let tokens = transport.tokens_seen();
    assert_eq!(tokens.iter().filter(|t| *t == "stale").count(), 2);
    assert_eq!(tokens.iter().filter(|t| *t == "fresh").count(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rejected_refresh_delivers_original_failure() {
    let transport = ScriptedTransport::accepting("fresh");
    let client = Arc::new(FakeOAuth2Client::failing_refresh(RequestError::from_status(
        401,
        "invalid_grant",
    )));
    let service = start_service(client.clone(), grant("stale", "r-1"), RetrySettings::default())
        .expect("service");

    let err = service.execute(get(&transport)).await.unwrap_err();

    assert_eq!(err, RequestError::from_status(401, "invalid_token"));
    assert_eq!(transport.calls(), 1);
    assert_eq!(client.refresh_calls(), 1);
    assert_eq!(service.current_grant().access_token(), "stale");
    assert!(!service.refresh_gate().is_in_flight());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn non_401_failure_is_never_retried() {
    let transport = ScriptedTransport::accepting("fresh");
    transport.fail_url_with(URL, 503);
    let client = Arc::new(FakeOAuth2Client::refreshing_to(grant("fresh", "r-2")));
    let service = start_service(client.clone(), grant("fresh", "r-1"), RetrySettings::default())
        .expect("service");

    let err = service.execute(get(&transport)).await.unwrap_err();

    assert_eq!(err.status(), Some(503));
    assert_eq!(transport.calls(), 1);
    assert_eq!(client.refresh_calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelled_request_is_not_retried_after_refresh() {
    let transport = ScriptedTransport::accepting("fresh");
    let client = Arc::new(
        FakeOAuth2Client::refreshing_to(grant("fresh", "r-2"))
            .with_latency(Duration::from_millis(150)),
    );
    let service = start_service(client.clone(), grant("stale", "r-1"), RetrySettings::default())
        .expect("service");

    let handle = service.submit(get(&transport), Vec::new());
    wait_until(|| service.refresh_gate().is_in_flight()).await;
    handle.cancel();

    assert_eq!(handle.outcome().await, Err(RequestError::Cancelled));

    // The refresh it triggered still completes and installs the new grant.
    wait_until(|| service.current_grant().access_token() == "fresh").await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.calls(), 1);
    assert_eq!(client.refresh_calls(), 1);
    assert!(service.registry().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn set_current_grant_round_trips_and_advances_generation() {
    let client = Arc::new(FakeOAuth2Client::refreshing_to(grant("unused", "r")));
    let service = start_service(client, grant("g1", "r-1"), RetrySettings::default())
        .expect("service");
    let before = service.current_snapshot().generation;

    let g2 = grant("g2", "r-2");
    let generation = service.set_current_grant(g2.clone());

    assert_eq!(*service.current_grant(), g2);
    assert!(generation > before);
    assert_eq!(service.subscribe().borrow().generation, generation);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn replacing_grant_rebinds_in_flight_requests() {
    let transport = ScriptedTransport::with_latency("fresh", Duration::from_millis(100));
    let client = Arc::new(FakeOAuth2Client::refreshing_to(grant("unused", "r")));
    let service = start_service(client.clone(), grant("stale", "r-1"), RetrySettings::default())
        .expect("service");

    let request = Arc::new(get(&transport));
    let handle = service.submit_shared(Arc::clone(&request), Vec::new());
    wait_until(|| transport.calls() == 1).await;
    assert!(service.registry().contains(request.grant_binding().id()));

    let generation = service.set_current_grant(grant("fresh", "r-2"));
    let bound = request.grant_binding().current().expect("bound grant");
    assert_eq!(bound.generation, generation);
    assert_eq!(bound.grant.access_token(), "fresh");

    // The in-flight attempt used the old grant; the retry uses the new one without a refresh.
    assert_eq!(handle.outcome().await.expect("retry succeeds")["token"], "fresh");
    assert_eq!(transport.tokens_seen(), vec!["stale", "fresh"]);
    assert_eq!(client.refresh_calls(), 0);
    assert!(!service.registry().contains(request.grant_binding().id()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn login_installs_grant_and_rebinds_outstanding_requests() {
    let transport = ScriptedTransport::with_latency("fresh", Duration::from_millis(100));
    let client = Arc::new(
        FakeOAuth2Client::refreshing_to(grant("unused", "r"))
            .with_login_result(Ok(grant("fresh", "r-login"))),
    );
    let service = start_service(
        client.clone(),
        AccessGrant::blank(),
        RetrySettings::default(),
    )
    .expect("service");

    let request = Arc::new(get(&transport));
    let handle = service.submit_shared(Arc::clone(&request), Vec::new());
    wait_until(|| transport.calls() == 1).await;

    let logged_in = service
        .login("alice", "pw")
        .outcome()
        .await
        .expect("login succeeds");

    assert_eq!(logged_in.access_token(), "fresh");
    assert_eq!(service.current_grant().refresh_token(), "r-login");
    assert_eq!(
        request
            .grant_binding()
            .current()
            .expect("bound")
            .grant
            .access_token(),
        "fresh"
    );
    assert_eq!(handle.outcome().await.expect("request")["token"], "fresh");
    assert_eq!(client.login_calls(), 1);
    assert_eq!(client.refresh_calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_login_keeps_current_grant() {
    let client = Arc::new(
        FakeOAuth2Client::refreshing_to(grant("unused", "r"))
            .with_login_result(Err(RequestError::from_status(401, "bad credentials"))),
    );
    let service = start_service(client.clone(), grant("g1", "r-1"), RetrySettings::default())
        .expect("service");
    let before = service.current_snapshot();

    let err = service.login("alice", "wrong").outcome().await.unwrap_err();

    assert!(err.is_unauthorized());
    assert_eq!(service.current_snapshot(), before);
    assert_eq!(client.refresh_calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn missing_refresh_token_abandons_without_refresh() {
    let transport = ScriptedTransport::accepting("fresh");
    let client = Arc::new(FakeOAuth2Client::refreshing_to(grant("fresh", "r-2")));
    let service = start_service(client.clone(), grant("stale", ""), RetrySettings::default())
        .expect("service");

    let err = service.execute(get(&transport)).await.unwrap_err();

    assert!(err.is_unauthorized());
    assert_eq!(client.refresh_calls(), 0);
    assert_eq!(transport.calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn configured_retry_delay_is_applied_after_refresh() {
    let transport = ScriptedTransport::accepting("fresh");
    let client = Arc::new(FakeOAuth2Client::refreshing_to(grant("fresh", "r-2")));
    let settings = RetrySettings {
        retry_delay: Duration::from_millis(120),
        ..RetrySettings::default()
    };
    let service = start_service(client.clone(), grant("stale", "r-1"), settings).expect("service");

    let started = tokio::time::Instant::now();
    service.execute(get(&transport)).await.expect("request succeeds");

    assert!(started.elapsed() >= Duration::from_millis(120));
    assert_eq!(transport.calls(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn refresh_that_still_yields_401_is_not_refreshed_again() {
    // The token endpoint hands out a grant the resource server also rejects.
    let transport = ScriptedTransport::accepting("never");
    let client = Arc::new(FakeOAuth2Client::refreshing_to(grant("also-bad", "r-2")));
    let service = start_service(client.clone(), grant("stale", "r-1"), RetrySettings::default())
        .expect("service");

    let err = service.execute(get(&transport)).await.unwrap_err();

    assert!(err.is_unauthorized());
    assert_eq!(transport.tokens_seen(), vec!["stale", "also-bad"]);
    assert_eq!(client.refresh_calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn oauth_client_is_shared_with_callers() {
    let client = Arc::new(FakeOAuth2Client::refreshing_to(grant("fresh", "r-2")));
    let service = start_service(client.clone(), grant("g1", "r-1"), RetrySettings::default())
        .expect("service");

    let refreshed = service
        .oauth2_client()
        .refresh_token("manual")
        .await
        .expect("refresh");

    assert_eq!(refreshed.access_token(), "fresh");
    assert_eq!(client.refresh_tokens_seen(), vec!["manual"]);
    // Direct client calls bypass the dispatcher and leave the store alone.
    assert_eq!(service.current_grant().access_token(), "g1");
}

/// Storage whose writes block like a slow disk.
struct SlowStorage {
    delay: Duration,
    saved: Mutex<Option<AccessGrant>>,
}

impl CredentialStorage for SlowStorage {
    fn load(&self) -> AppResult<Option<AccessGrant>> {
        Ok(self.saved.lock().unwrap().clone())
    }

    fn save(&self, grant: &AccessGrant) -> AppResult<()> {
        std::thread::sleep(self.delay);
        *self.saved.lock().unwrap() = Some(grant.clone());
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn grant_replaced_during_slow_persist_is_used_by_retry() {
    let transport = ScriptedTransport::with_latency("fresh", Duration::from_millis(50));
    let client = Arc::new(FakeOAuth2Client::refreshing_to(grant("unused", "r")));
    let storage = Arc::new(SlowStorage {
        delay: Duration::from_millis(400),
        saved: Mutex::new(None),
    });
    let service = start_service_with_storage(
        client.clone(),
        grant("stale", "r-1"),
        RetrySettings::default(),
        storage.clone(),
    )
    .expect("service");

    let handle = service.submit(get(&transport), Vec::new());
    wait_until(|| transport.calls() == 1).await;
    let replacer = {
        let service = service.clone();
        tokio::task::spawn_blocking(move || service.set_current_grant(grant("fresh", "r-2")))
    };

    let body = handle.outcome().await.expect("retry uses the installed grant");

    assert_eq!(body["token"], "fresh");
    assert_eq!(transport.tokens_seen(), vec!["stale", "fresh"]);
    assert_eq!(client.refresh_calls(), 0);
    replacer.await.expect("replace finished");
    assert_eq!(
        storage.load().unwrap().map(|g| g.access_token().to_string()),
        Some("fresh".to_string())
    );
}

/// A consumer that reads its binding directly instead of through `grant_for_attempt`, and
/// holds the token for `send_after` before sending it.
struct DirectBindingReader {
    binding: GrantBinding,
    transport: Arc<ScriptedTransport>,
    send_after: Duration,
}

impl Request for DirectBindingReader {
    type Output = Value;

    fn execute_network_call(&self) -> BoxFuture<'_, Result<Value, RequestError>> {
        Box::pin(async move {
            let token = self
                .binding
                .current()
                .map(|s| s.grant.access_token().to_string())
                .unwrap_or_default();
            tokio::time::sleep(self.send_after).await;
            let reply = self
                .transport
                .exchange(HttpCall {
                    method: Method::GET,
                    url: URL.to_string(),
                    headers: build_auth_header(&token)?,
                    body: None,
                })
                .await?;
            serde_json::from_slice(&reply.body)
                .map_err(|e| RequestError::InvalidResponse(e.to_string()))
        })
    }

    fn as_credential_consumer(&self) -> Option<&dyn ConsumesCredential> {
        Some(self)
    }
}

impl ConsumesCredential for DirectBindingReader {
    fn grant_binding(&self) -> &GrantBinding {
        &self.binding
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn late_401_after_completed_refresh_does_not_refresh_again_for_custom_consumer() {
    let transport = ScriptedTransport::accepting("fresh");
    let client = Arc::new(FakeOAuth2Client::refreshing_to(grant("fresh", "r-2")));
    let service = start_service(client.clone(), grant("stale", "r-1"), RetrySettings::default())
        .expect("service");

    let reader = |send_after| DirectBindingReader {
        binding: GrantBinding::new(),
        transport: Arc::clone(&transport),
        send_after,
    };
    let fast = service.submit(reader(Duration::from_millis(20)), Vec::new());
    let slow = service.submit(reader(Duration::from_millis(200)), Vec::new());

    assert_eq!(fast.outcome().await.expect("fast")["token"], "fresh");
    assert_eq!(slow.outcome().await.expect("slow")["token"], "fresh");
    assert_eq!(client.refresh_calls(), 1);
    assert_eq!(service.refresh_gate().refreshes_launched(), 1);
    assert_eq!(client.refresh_tokens_seen(), vec!["r-1"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn resubmitting_an_in_flight_request_is_rejected() {
    let transport = ScriptedTransport::with_latency("fresh", Duration::from_millis(100));
    let client = Arc::new(FakeOAuth2Client::refreshing_to(grant("unused", "r")));
    let service = start_service(client, grant("fresh", "r-1"), RetrySettings::default())
        .expect("service");
    let request = Arc::new(get(&transport));

    let first = service.submit_shared(Arc::clone(&request), Vec::new());
    let duplicate = service.submit_shared(Arc::clone(&request), Vec::new());

    assert_eq!(duplicate.outcome().await, Err(RequestError::AlreadyActive));
    assert!(service.registry().contains(request.grant_binding().id()));
    assert_eq!(first.outcome().await.expect("first")["token"], "fresh");
    assert_eq!(transport.calls(), 1);

    // Once finished, the same request may be submitted again.
    let again = service.submit_shared(Arc::clone(&request), Vec::new());
    assert_eq!(again.outcome().await.expect("again")["token"], "fresh");
    assert_eq!(transport.calls(), 2);
    assert!(service.registry().is_empty());
}

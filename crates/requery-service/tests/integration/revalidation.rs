use std::sync::Arc;
use std::time::Duration;

use requery_service::environment::ManualEnvironment;
use tokio::time;

use crate::{Calls, MockFetcher, UserClient, advance, setup, user_options};

fn mock() -> MockFetcher<String> {
    let mock = MockFetcher::new();
    mock.always(Ok("A".into()));
    mock
}

#[tokio::test]
async fn test_refresh_on_focus() {
    setup();
    time::pause();

    let mock = mock();
    let env = Arc::new(ManualEnvironment::new());
    let options = user_options()
        .refresh_on_focus(true)
        .environment(env.clone());
    let query = UserClient::new().query(mock.fetcher(), options).unwrap();

    // nothing to refresh before the first call
    assert!(!query.revalidate().await);
    assert_eq!(mock.accesses(), 0);

    query.run_async(1).await.unwrap();
    env.focus();
    advance(1).await;
    assert_eq!(mock.accesses(), 2);

    // throttled
    env.focus();
    advance(1_000).await;
    assert_eq!(mock.accesses(), 2);

    advance(5_000).await;
    env.focus();
    advance(1).await;
    assert_eq!(mock.accesses(), 3);
}

#[tokio::test]
async fn test_hidden() {
    setup();
    time::pause();

    let mock = mock();
    let env = Arc::new(ManualEnvironment::new());
    let options = user_options()
        .refresh_on_focus(true)
        .environment(env.clone());
    let query = UserClient::new().query(mock.fetcher(), options).unwrap();
    query.run_async(1).await.unwrap();

    env.set_visible(false);
    assert!(!query.revalidate().await);

    // becoming visible again counts as focus
    env.set_visible(true);
    advance(1).await;
    assert_eq!(mock.accesses(), 2);

    let options = user_options()
        .revalidate_when_hidden(true)
        .environment(env.clone());
    let query = UserClient::new().query(mock.fetcher(), options).unwrap();
    query.run_async(1).await.unwrap();

    env.set_visible(false);
    assert!(query.revalidate().await);
    assert_eq!(mock.accesses(), 4);
}

#[tokio::test]
async fn test_refresh_on_reconnect() {
    setup();
    time::pause();

    let mock = mock();
    let env = Arc::new(ManualEnvironment::new());
    let options = user_options()
        .refresh_on_reconnect(true)
        .environment(env.clone());
    let query = UserClient::new().query(mock.fetcher(), options).unwrap();
    query.run_async(1).await.unwrap();

    env.set_online(false);
    assert!(!query.revalidate().await);
    assert_eq!(mock.accesses(), 1);

    env.set_online(true);
    advance(1).await;
    assert_eq!(mock.accesses(), 2);
}

#[tokio::test]
async fn test_polling() {
    setup();
    time::pause();

    let mock = mock();
    let options = user_options().polling_interval(Duration::from_millis(100));
    let query = UserClient::new().query(mock.fetcher(), options).unwrap();
    query.run_async(1).await.unwrap();

    advance(350).await;
    assert_eq!(mock.accesses(), 4);

    query.pause();
    assert!(!query.is_active());
    advance(500).await;
    assert_eq!(mock.accesses(), 4);

    // imperative calls still work while paused
    assert!(!query.revalidate().await);
    query.run_async(1).await.unwrap();
    assert_eq!(mock.accesses(), 5);

    query.resume();
    assert!(query.is_active());
    advance(150).await;
    assert_eq!(mock.accesses(), 6);
}

#[tokio::test]
async fn test_pause_cancels_call_in_progress() {
    setup();
    time::pause();

    let calls = Calls::default();
    let mock = MockFetcher::with_latency(Duration::from_millis(100));
    mock.always(Ok("A".into()));
    let client = UserClient::new();
    let options = user_options().on_success({
        let calls = calls.clone();
        move |data, id| calls.push(format!("success {id}: {data}"))
    });
    let query = client.query(mock.fetcher(), options).unwrap();

    query.run(1);
    advance(10).await;
    assert!(query.loading());
    assert_eq!(mock.accesses(), 1);

    query.pause();
    assert!(!query.loading());

    advance(200).await;
    assert!(!query.loading());
    assert_eq!(query.data(), None);
    assert!(query.error().is_none());
    assert!(calls.take().is_empty());
    assert!(client.store().get_cache("user:1").is_none());
    assert!(client.inflight().is_empty());
}

#[tokio::test]
async fn test_update_deps() {
    setup();

    let mock = mock();
    let query = UserClient::new()
        .query(mock.fetcher(), user_options())
        .unwrap();
    query.run_async(1).await.unwrap();

    assert!(!query.update_deps(&("filter", 1)).await);
    assert!(!query.update_deps(&("filter", 1)).await);
    assert_eq!(mock.accesses(), 1);

    assert!(query.update_deps(&("filter", 2)).await);
    assert_eq!(mock.accesses(), 2);
}

use std::time::Duration;

use requery_service::error::QueryError;
use requery_service::query::{Query, QueryOptions};
use tokio::time;

use crate::{Calls, MockFetcher, UserClient, advance, setup, user_options};

#[tokio::test]
async fn test_background_run() {
    setup();
    time::pause();

    let calls = Calls::default();
    let mock = MockFetcher::with_latency(Duration::from_millis(100));
    mock.respond_ok("A".into());

    let options = user_options()
        .on_before({
            let calls = calls.clone();
            move |id| calls.push(format!("before {id}"))
        })
        .on_success({
            let calls = calls.clone();
            move |data, id| calls.push(format!("success {id}: {data}"))
        })
        .on_finally({
            let calls = calls.clone();
            move |id, data, err| calls.push(format!("finally {id}: {data:?} {err:?}"))
        });
    let query = UserClient::new().query(mock.fetcher(), options).unwrap();
    assert!(!query.loading());

    query.run(1);
    advance(10).await;
    assert!(query.loading());
    assert!(query.initializing());
    assert_eq!(query.params(), Some(1));

    advance(100).await;
    assert!(!query.loading());
    assert!(!query.initializing());
    insta::assert_debug_snapshot!(query.state(), @r#"
    QueryState {
        data: Some(
            "A",
        ),
        error: None,
        loading: false,
        params: Some(
            1,
        ),
        loading_slow: false,
    }
    "#);
    assert_eq!(
        calls.take(),
        [
            "before 1",
            "success 1: A",
            "finally 1: Some(\"A\") None"
        ]
    );
}

#[tokio::test]
async fn test_refreshing_keeps_data() {
    setup();
    time::pause();

    let mock = MockFetcher::with_latency(Duration::from_millis(100));
    mock.respond_ok("A".into()).respond_ok("B".into());
    let query = UserClient::new()
        .query(mock.fetcher(), user_options())
        .unwrap();

    query.run_async(1).await.unwrap();
    query.refresh();
    advance(10).await;
    assert!(query.refreshing());
    assert_eq!(query.data().as_deref(), Some("A"));

    advance(100).await;
    assert!(!query.refreshing());
    assert_eq!(query.data().as_deref(), Some("B"));
}

#[tokio::test]
async fn test_clear_before_run() {
    setup();
    time::pause();

    let mock = MockFetcher::with_latency(Duration::from_millis(100));
    mock.respond_ok("A".into()).respond_ok("B".into());
    let options = user_options().clear_before_run(true);
    let query = UserClient::new().query(mock.fetcher(), options).unwrap();

    query.run_async(1).await.unwrap();
    query.run(1);
    advance(10).await;
    assert!(query.initializing());
    assert_eq!(query.data(), None);

    advance(100).await;
    assert_eq!(query.data().as_deref(), Some("B"));
}

#[tokio::test]
async fn test_failure() {
    setup();

    let calls = Calls::default();
    let mock = MockFetcher::new();
    mock.respond_ok("A".into()).respond_err("boom");

    let options = user_options()
        .retry_count(0)
        .on_error({
            let calls = calls.clone();
            move |err, id| calls.push(format!("error {id}: {err}"))
        })
        .on_finally({
            let calls = calls.clone();
            move |id, data, err| calls.push(format!("finally {id}: {data:?} {}", err.is_some()))
        });
    let query = UserClient::new().query(mock.fetcher(), options).unwrap();

    query.run_async(1).await.unwrap();
    calls.take();

    let err = query.run_async(1).await.unwrap_err();
    assert!(matches!(err, QueryError::Fetch(_)));
    assert_eq!(err.to_string(), "fetch failed: boom");

    // the earlier data is kept next to the error
    let state = query.state();
    assert_eq!(state.data.as_deref(), Some("A"));
    assert!(state.error.is_some());
    assert!(!state.loading);
    assert_eq!(
        calls.take(),
        ["error 1: fetch failed: boom", "finally 1: None true"]
    );
}

#[tokio::test]
async fn test_superseded_by_faster_call() {
    setup();
    time::pause();

    let mock = MockFetcher::new();
    mock.respond(Ok("A".into()), Duration::from_millis(200))
        .respond(Ok("B".into()), Duration::from_millis(50));
    let client = UserClient::new();
    let query = client.query(mock.fetcher(), user_options()).unwrap();

    let (first, second) = tokio::join!(query.run_async(1), async {
        advance(10).await;
        query.run_async(2).await
    });
    assert!(matches!(first, Err(QueryError::Stale)));
    assert_eq!(second.unwrap(), "B");

    assert_eq!(query.data().as_deref(), Some("B"));
    assert_eq!(query.params(), Some(2));
    assert!(!query.loading());
    // superseded results are not cached either
    assert!(client.store().get_cache("user:1").is_none());
    assert_eq!(client.store().get_cache("user:2").unwrap().data, "B");
}

#[tokio::test]
async fn test_superseded_by_slower_call() {
    setup();
    time::pause();

    let calls = Calls::default();
    let mock = MockFetcher::new();
    mock.respond(Ok("A".into()), Duration::from_millis(50))
        .respond(Ok("B".into()), Duration::from_millis(200));
    let options = user_options().on_success({
        let calls = calls.clone();
        move |data, id| calls.push(format!("success {id}: {data}"))
    });
    let client = UserClient::new();
    let query = client.query(mock.fetcher(), options).unwrap();

    let (first, second) = tokio::join!(query.run_async(1), async {
        advance(10).await;
        query.run_async(2).await
    });
    assert!(matches!(first, Err(QueryError::Stale)));
    assert_eq!(second.unwrap(), "B");

    // "A" arrived first, but never made it into the state
    assert_eq!(calls.take(), ["success 2: B"]);
    assert_eq!(query.data().as_deref(), Some("B"));
    assert!(client.store().get_cache("user:1").is_none());
}

#[tokio::test]
async fn test_cancel() {
    setup();
    time::pause();

    let calls = Calls::default();
    let mock = MockFetcher::with_latency(Duration::from_millis(100));
    mock.always(Ok("A".into()));
    let options = user_options().on_finally({
        let calls = calls.clone();
        move |id, _, _| calls.push(format!("finally {id}"))
    });
    let client = UserClient::new();
    let query = client.query(mock.fetcher(), options).unwrap();

    let (result, _) = tokio::join!(query.run_async(1), async {
        advance(10).await;
        query.cancel();
        assert!(!query.loading());
    });
    assert!(matches!(result, Err(QueryError::Cancelled)));
    assert_eq!(query.data(), None);
    assert!(calls.take().is_empty());
    assert!(client.store().get_cache("user:1").is_none());

    // cancelling does not stop the query from running again
    assert_eq!(query.run_async(1).await.unwrap(), "A");
    assert_eq!(mock.accesses(), 2);
}

#[tokio::test]
async fn test_loading_slow() {
    setup();
    time::pause();

    let mock = MockFetcher::with_latency(Duration::from_millis(100));
    mock.always(Ok("A".into()));
    let options = user_options().loading_timeout(Duration::from_millis(50));
    let query = UserClient::new().query(mock.fetcher(), options).unwrap();

    query.run(1);
    advance(30).await;
    assert!(query.loading());
    assert!(!query.loading_slow());

    advance(30).await;
    assert!(query.loading_slow());

    advance(100).await;
    assert!(!query.loading());
    assert!(!query.loading_slow());
    assert_eq!(query.data().as_deref(), Some("A"));
}

#[tokio::test]
async fn test_auto_run() {
    setup();
    time::pause();

    let mock = MockFetcher::new();
    mock.respond_ok("A".into());
    let options = QueryOptions::default().manual(false).default_params(7);
    let query: Query<String, u32> = Query::new(mock.fetcher(), options).unwrap();

    advance(1).await;
    assert_eq!(query.data().as_deref(), Some("A"));
    assert_eq!(mock.all_hits(), [("7".to_owned(), 1)]);
}

#[tokio::test]
async fn test_invalid_options() {
    setup();

    let mock = MockFetcher::<String>::new();
    let err = UserClient::new()
        .query(mock.fetcher(), user_options().manual(false))
        .unwrap_err();
    assert!(matches!(err, QueryError::Configuration(_)));

    let query = UserClient::new()
        .query(mock.fetcher(), user_options())
        .unwrap();
    let err = query.refresh_async().await.unwrap_err();
    assert!(matches!(err, QueryError::Configuration(_)));
    assert_eq!(mock.accesses(), 0);
}

#[test]
fn test_requires_runtime() {
    setup();

    let mock = MockFetcher::<String>::new();
    let err = UserClient::new()
        .query(mock.fetcher(), user_options())
        .unwrap_err();
    assert!(matches!(err, QueryError::Configuration(_)));
}

#[tokio::test]
async fn test_teardown_on_drop() {
    setup();
    time::pause();

    let mock = MockFetcher::with_latency(Duration::from_millis(100));
    mock.always(Ok("A".into()));
    let client = UserClient::new();
    let options = user_options().polling_interval(Duration::from_millis(500));
    let query = client.query(mock.fetcher(), options).unwrap();
    let changes = query.subscribe();

    query.run(1);
    advance(10).await;
    assert_eq!(mock.accesses(), 1);
    drop(query);

    advance(2_000).await;
    // neither the call in progress nor polling outlive the query
    assert!(changes.has_changed().is_err());
    assert!(client.store().get_cache("user:1").is_none());
    assert_eq!(mock.accesses(), 1);
}

use std::time::Duration;

use requery_service::error::QueryError;
use requery_service::retry::RetryInterval;
use tokio::time::{self, Instant};

use crate::{Calls, MockFetcher, UserClient, advance, setup, user_options};

#[tokio::test]
async fn test_retries_until_exhausted() {
    setup();
    time::pause();

    let calls = Calls::default();
    let mock = MockFetcher::new();
    mock.always(Err("boom".into()));

    let options = user_options()
        .retry_count(2)
        .on_error({
            let calls = calls.clone();
            move |_, id| calls.push(format!("error {id}"))
        })
        .on_error_retry({
            let calls = calls.clone();
            move |_, state| calls.push(format!("retry {}", state.current_count))
        })
        .on_retry_failed({
            let calls = calls.clone();
            move |_, state| {
                calls.push(format!("failed after {}", state.current_count));
                Ok(())
            }
        });
    let query = UserClient::new().query(mock.fetcher(), options).unwrap();

    let start = Instant::now();
    let err = query.run_async(1).await.unwrap_err();
    // exponential backoff: 1s, then 2s
    assert!(start.elapsed() >= Duration::from_secs(3));

    assert_eq!(err.to_string(), "fetch failed: boom");
    assert_eq!(mock.accesses(), 3);
    assert_eq!(
        calls.take(),
        [
            "error 1",
            "retry 1",
            "error 1",
            "retry 2",
            "error 1",
            "failed after 3"
        ]
    );

    let state = query.state();
    assert!(state.error.is_some());
    assert!(!state.loading);
}

#[tokio::test]
async fn test_recovers() {
    setup();
    time::pause();

    let mock = MockFetcher::new();
    mock.respond_err("boom")
        .respond_err("boom")
        .respond_ok("A".into());

    let options = user_options().retry_interval(RetryInterval::Fixed(Duration::from_millis(10)));
    let query = UserClient::new().query(mock.fetcher(), options).unwrap();

    assert_eq!(query.run_async(1).await.unwrap(), "A");
    assert_eq!(mock.accesses(), 3);
    assert!(query.error().is_none());
}

#[tokio::test]
async fn test_error_waits_for_settle() {
    setup();
    time::pause();

    let mock = MockFetcher::new();
    mock.respond_err("boom").respond_ok("A".into());

    let options = user_options().retry_interval(RetryInterval::Fixed(Duration::from_millis(100)));
    let query = UserClient::new().query(mock.fetcher(), options).unwrap();

    query.run(1);
    advance(50).await;
    // the first attempt failed, a retry is pending
    assert_eq!(mock.accesses(), 1);
    assert!(query.loading());
    assert!(query.error().is_none());

    advance(100).await;
    assert!(!query.loading());
    assert_eq!(query.data().as_deref(), Some("A"));
    assert!(query.error().is_none());
}

#[tokio::test]
async fn test_propagate_exhaustion() {
    setup();
    time::pause();

    let mock = MockFetcher::new();
    mock.always(Err("boom".into()));

    let options = user_options()
        .retry_count(1)
        .on_retry_failed(|err, state| Err(QueryError::retry_exhausted(err, state)));
    let query = UserClient::new().query(mock.fetcher(), options).unwrap();

    let err = query.run_async(1).await.unwrap_err();
    assert!(matches!(err, QueryError::RetryExhausted { attempts: 2, .. }));
    assert_eq!(err.to_string(), "gave up after 2 attempts: fetch failed: boom");
    assert!(matches!(
        query.error(),
        Some(QueryError::RetryExhausted { .. })
    ));
}

#[tokio::test]
async fn test_new_call_orphans_retry() {
    setup();
    time::pause();

    let mock = MockFetcher::new();
    mock.respond_err("boom").always(Ok("B".into()));

    let options = user_options().retry_interval(RetryInterval::Fixed(Duration::from_secs(1)));
    let query = UserClient::new().query(mock.fetcher(), options).unwrap();

    let (first, second) = tokio::join!(query.run_async(1), async {
        time::sleep(Duration::from_millis(500)).await;
        query.run_async(2).await
    });
    assert!(matches!(first, Err(QueryError::Stale)));
    assert_eq!(second.unwrap(), "B");

    // the pending retry of the first call never ran
    time::sleep(Duration::from_secs(5)).await;
    assert_eq!(mock.all_hits(), [("1".to_owned(), 1), ("2".to_owned(), 1)]);
    assert!(query.error().is_none());
}

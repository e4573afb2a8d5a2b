use std::time::Duration;

use requery_service::ratelimit::{DebounceOptions, ThrottleOptions};
use tokio::time;

use crate::{MockFetcher, UserClient, advance, setup, user_options};

fn mock() -> MockFetcher<String> {
    let mock = MockFetcher::new();
    mock.always(Ok("A".into()));
    mock
}

#[tokio::test]
async fn test_debounced_run() {
    setup();
    time::pause();

    let mock = mock();
    let options = user_options().debounce(DebounceOptions::new(Duration::from_millis(100)));
    let query = UserClient::new().query(mock.fetcher(), options).unwrap();

    query.run(1);
    advance(50).await;
    query.run(2);
    advance(50).await;
    query.run(3);
    advance(50).await;
    assert_eq!(mock.accesses(), 0);

    advance(100).await;
    assert_eq!(mock.all_hits(), [("3".to_owned(), 1)]);
    assert_eq!(query.params(), Some(3));

    // not debounced
    query.run_async(4).await.unwrap();
    assert_eq!(mock.accesses(), 1);
}

#[tokio::test]
async fn test_throttled_run() {
    setup();
    time::pause();

    let mock = mock();
    let options = user_options().throttle(ThrottleOptions::new(Duration::from_millis(100)));
    let query = UserClient::new().query(mock.fetcher(), options).unwrap();

    query.run(1);
    query.run(2);
    query.run(3);
    advance(10).await;
    assert_eq!(mock.all_hits(), [("1".to_owned(), 1)]);

    advance(150).await;
    assert_eq!(mock.all_hits(), [("3".to_owned(), 1)]);
    assert_eq!(query.data().as_deref(), Some("A"));
}

#[tokio::test]
async fn test_cancel_drops_pending_run() {
    setup();
    time::pause();

    let mock = mock();
    let options = user_options().debounce(DebounceOptions::new(Duration::from_millis(100)));
    let query = UserClient::new().query(mock.fetcher(), options).unwrap();

    query.run(1);
    query.cancel();
    advance(500).await;
    assert_eq!(mock.accesses(), 0);

    query.refresh();
    advance(500).await;
    assert_eq!(mock.accesses(), 0);
}

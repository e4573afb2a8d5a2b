use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use requery_service::cache::{KeyFilter, Mutation};
use requery_service::config::CacheSettings;
use requery_service::query::{Query, QueryClient, QueryOptions};
use tokio::time;

use crate::{MockFetcher, UserClient, advance, setup, user_options};

#[tokio::test]
async fn test_results_are_shared() {
    setup();

    let client = UserClient::new();
    let mock = MockFetcher::new();
    mock.respond_ok("A".into());

    let first = client.query(mock.fetcher(), user_options()).unwrap();
    assert_eq!(first.run_async(1).await.unwrap(), "A");
    assert_eq!(first.cache_key().as_deref(), Some("user:1"));

    let cached = client.store().get_cache("user:1").unwrap();
    assert_eq!(cached.data, "A");
    assert_eq!(cached.params, 1);

    // another query for the same key starts out with the cached data
    let second = client
        .query(mock.fetcher(), user_options().default_params(1))
        .unwrap();
    assert_eq!(second.data().as_deref(), Some("A"));
    assert_eq!(second.params(), Some(1));
    assert!(!second.loading());
    assert_eq!(mock.accesses(), 1);
}

#[tokio::test]
async fn test_expiration() {
    setup();
    time::pause();

    let client = UserClient::new();
    let mock = MockFetcher::new();
    mock.respond_ok("A".into());

    let options = user_options().cache_expiration(Some(Duration::from_millis(100)));
    let query = client.query(mock.fetcher(), options).unwrap();
    query.run_async(1).await.unwrap();

    advance(50).await;
    assert!(client.store().get_cache("user:1").is_some());

    advance(100).await;
    assert!(client.store().get_cache("user:1").is_none());
    // expiring drops the data, but the query still knows how to refresh
    assert_eq!(query.data(), None);
    assert_eq!(query.params(), Some(1));
}

#[tokio::test]
async fn test_concurrent_fetches_are_coalesced() {
    setup();
    time::pause();

    let client = UserClient::new();
    let mock = MockFetcher::with_latency(Duration::from_millis(100));
    mock.always(Ok("A".into()));

    let queries: Vec<_> = (0..3)
        .map(|_| client.query(mock.fetcher(), user_options()).unwrap())
        .collect();

    let (a, b, c) = tokio::join!(
        queries[0].run_async(1),
        queries[1].run_async(1),
        queries[2].run_async(1),
    );
    assert_eq!(a.unwrap(), "A");
    assert_eq!(b.unwrap(), "A");
    assert_eq!(c.unwrap(), "A");
    assert_eq!(mock.accesses(), 1);
    assert!(client.inflight().is_empty());

    // the next call fetches again
    queries[0].run_async(1).await.unwrap();
    assert_eq!(mock.accesses(), 2);
}

#[tokio::test]
async fn test_idle_query_keeps_shared_fetch() {
    setup();
    time::pause();

    let client = UserClient::new();
    let mock = MockFetcher::with_latency(Duration::from_millis(100));
    mock.always(Ok("A".into()));

    let busy = client.query(mock.fetcher(), user_options()).unwrap();
    let idle = client
        .query(mock.fetcher(), user_options().default_params(1))
        .unwrap();
    let late = client.query(mock.fetcher(), user_options()).unwrap();
    assert_eq!(idle.cache_key().as_deref(), Some("user:1"));

    busy.run(1);
    advance(10).await;
    assert_eq!(mock.accesses(), 1);

    // a query without a call of its own leaves the fetch of another one alone
    idle.pause();
    drop(idle);
    assert_eq!(client.inflight().len(), 1);

    assert_eq!(late.run_async(1).await.unwrap(), "A");
    assert_eq!(mock.accesses(), 1);
    assert_eq!(busy.data().as_deref(), Some("A"));
}

#[tokio::test]
async fn test_cancel_abandons_own_fetch() {
    setup();
    time::pause();

    let client = UserClient::new();
    let mock = MockFetcher::with_latency(Duration::from_millis(100));
    mock.always(Ok("A".into()));

    let first = client.query(mock.fetcher(), user_options()).unwrap();
    let second = client.query(mock.fetcher(), user_options()).unwrap();

    first.run(1);
    advance(10).await;
    first.cancel();
    assert!(client.inflight().is_empty());

    // the next call starts over
    assert_eq!(second.run_async(1).await.unwrap(), "A");
    assert_eq!(mock.accesses(), 2);
    assert_eq!(first.data(), Some("A".into()));
}

#[tokio::test]
async fn test_standalone_queries_share_global_client() {
    setup();

    // the global client of these types is not used anywhere else in this binary
    let mock = MockFetcher::new();
    mock.respond_ok(42u64);
    let options = || QueryOptions::default().cache_key("answer");

    let first: Query<u64, String> = Query::new(mock.fetcher(), options()).unwrap();
    assert_eq!(first.run_async("life".into()).await.unwrap(), 42);

    let second: Query<u64, String> = Query::new(mock.fetcher(), options()).unwrap();
    assert_eq!(second.data(), Some(42));
    assert_eq!(second.params().as_deref(), Some("life"));
    assert_eq!(mock.accesses(), 1);

    let global = QueryClient::<u64, String>::global();
    assert_eq!(global.store().get_cache("answer").map(|e| e.data), Some(42));

    first.mutate(43);
    assert_eq!(second.data(), Some(43));
}

#[tokio::test]
async fn test_store_expiration_applies_to_queries() {
    setup();
    time::pause();

    let settings = CacheSettings {
        expiration: None,
        ..Default::default()
    };
    let client = UserClient::from_config(&settings);
    let mock = MockFetcher::new();
    mock.respond_ok("A".into()).respond_ok("B".into());

    let query = client.query(mock.fetcher(), user_options()).unwrap();
    query.run_async(1).await.unwrap();

    // a query can still override the store
    let options = user_options().cache_expiration(Some(Duration::from_secs(1)));
    let short = client.query(mock.fetcher(), options).unwrap();
    short.run_async(2).await.unwrap();

    advance(10 * 60 * 1000).await;
    let cached = client.store().get_cache("user:1").map(|e| e.data);
    assert_eq!(cached.as_deref(), Some("A"));
    assert_eq!(query.data().as_deref(), Some("A"));
    assert!(client.store().get_cache("user:2").is_none());
}

#[tokio::test]
async fn test_stale_time() {
    setup();
    time::pause();

    let mock = MockFetcher::new();
    mock.respond_ok("A".into()).respond_ok("B".into());

    let options = user_options().stale_time(Duration::from_secs(10));
    let query = UserClient::new().query(mock.fetcher(), options).unwrap();

    assert_eq!(query.run_async(1).await.unwrap(), "A");
    advance(5_000).await;
    assert_eq!(query.run_async(1).await.unwrap(), "A");
    assert_eq!(mock.accesses(), 1);

    advance(6_000).await;
    assert_eq!(query.run_async(1).await.unwrap(), "B");
    assert_eq!(mock.accesses(), 2);
}

#[tokio::test]
async fn test_mutate_notifies_once() {
    setup();

    let client = UserClient::new();
    let mock = MockFetcher::new();
    mock.respond_ok("A".into());

    let first = client.query(mock.fetcher(), user_options()).unwrap();
    let second = client
        .query(mock.fetcher(), user_options().default_params(1))
        .unwrap();
    first.run_async(1).await.unwrap();
    assert_eq!(second.data().as_deref(), Some("A"));

    let events = Arc::new(AtomicUsize::new(0));
    let _subscription = client.subscribe("user:1", {
        let events = Arc::clone(&events);
        move |_| {
            events.fetch_add(1, Ordering::Relaxed);
        }
    });

    first.mutate("B".into());
    assert_eq!(second.data().as_deref(), Some("B"));
    assert_eq!(client.store().get_cache("user:1").unwrap().data, "B");

    // writing the same value again is not a change
    first.mutate("B".into());
    assert_eq!(events.load(Ordering::Relaxed), 1);
    assert_eq!(mock.accesses(), 1);
}

#[tokio::test]
async fn test_mutate_to_none_deletes() {
    setup();

    let client = UserClient::new();
    let mock = MockFetcher::new();
    mock.respond_ok("A".into());

    let first = client.query(mock.fetcher(), user_options()).unwrap();
    let second = client
        .query(mock.fetcher(), user_options().default_params(1))
        .unwrap();
    first.run_async(1).await.unwrap();

    first.mutate_with(|data, params| {
        assert_eq!(data.map(String::as_str), Some("A"));
        (None, params.cloned())
    });
    assert!(client.store().get_cache("user:1").is_none());
    assert_eq!(first.data(), None);
    assert_eq!(second.data(), None);
}

#[tokio::test]
async fn test_client_mutations() {
    setup();

    let client = UserClient::new();
    let mock = MockFetcher::new();
    mock.respond_ok("A".into())
        .respond_ok("B".into())
        .respond_ok("A again".into());

    let first = client.query(mock.fetcher(), user_options()).unwrap();
    let second = client.query(mock.fetcher(), user_options()).unwrap();
    first.run_async(1).await.unwrap();
    second.run_async(2).await.unwrap();

    let mut touched = client.mutate(
        KeyFilter::Matching(&|key: &str| key.starts_with("user:")),
        Mutation::Data("anonymous".into()),
    );
    touched.sort();
    assert_eq!(touched, ["user:1", "user:2"]);
    assert_eq!(first.data().as_deref(), Some("anonymous"));
    assert_eq!(second.data().as_deref(), Some("anonymous"));
    assert_eq!(client.store().get_cache("user:2").unwrap().params, 2);

    client.clear_cache(None);
    assert!(client.store().keys().is_empty());
    assert_eq!(first.data(), None);
    assert_eq!(second.data(), None);

    // the parameters survive, so the queries can refresh
    assert_eq!(first.refresh_async().await.unwrap(), "A again");
    assert_eq!(mock.all_hits(), [("1".to_owned(), 2), ("2".to_owned(), 1)]);
}

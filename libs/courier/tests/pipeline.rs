#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![allow(clippy::unwrap_used, clippy::expect_used)]

//! End-to-end pipeline tests against the in-memory mock transport.

use courier::{
    CacheManager, CachePolicy, CancelToken, CircuitBreakerConfig, CircuitState, ErrorCode,
    ExponentialBackoff, HttpClient, HttpError, Interceptor, MockAdapter, MockReply, RequestConfig,
    Response, ResponseData, RetryPolicy,
};
use http::header::{HeaderName, HeaderValue};
use http::{Method, StatusCode};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn fast_retry() -> RetryPolicy {
    RetryPolicy::default().with_backoff(ExponentialBackoff::fast())
}

fn client_with(mock: &Arc<MockAdapter>) -> HttpClient {
    HttpClient::builder()
        .mock(Arc::clone(mock))
        .base_url("https://api.example.com")
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_second_get_is_served_from_cache() {
    let mock = Arc::new(MockAdapter::new());
    mock.reply(
        Method::GET,
        "/users",
        MockReply::json(StatusCode::OK, &json!([{"id": 1, "name": "Alice"}])),
    );
    let client = HttpClient::builder()
        .mock(Arc::clone(&mock))
        .base_url("https://api.example.com")
        .cache(CacheManager::in_memory(), CachePolicy::default())
        .build()
        .unwrap();

    let first = client.get("/users").send().await.unwrap();
    let second = client.get("/users").send().await.unwrap();

    assert_eq!(mock.calls_to("/users"), 1);
    assert_eq!(first.data.as_json(), second.data.as_json());
    assert_eq!(second.status, StatusCode::OK);

    // Different query string, different entry.
    client.get("/users").param("page", "2").send().await.unwrap();
    assert_eq!(mock.calls_to("/users"), 2);
}

#[tokio::test]
async fn test_mutations_bypass_cache() {
    let mock = Arc::new(MockAdapter::new());
    mock.reply(Method::POST, "/users", MockReply::status(StatusCode::CREATED));
    let client = HttpClient::builder()
        .mock(Arc::clone(&mock))
        .base_url("https://api.example.com")
        .cache(CacheManager::in_memory(), CachePolicy::default())
        .build()
        .unwrap();

    for _ in 0..2 {
        client
            .post("/users")
            .json(&json!({"name": "Bob"}))
            .send()
            .await
            .unwrap();
    }
    assert_eq!(mock.calls_to("/users"), 2);
}

#[tokio::test]
async fn test_error_responses_are_not_cached() {
    let mock = Arc::new(MockAdapter::new());
    mock.sequence(
        Method::GET,
        "/report",
        vec![
            MockReply::status(StatusCode::NOT_FOUND),
            MockReply::json(StatusCode::OK, &json!({"ready": true})),
        ],
    );
    let client = HttpClient::builder()
        .mock(Arc::clone(&mock))
        .base_url("https://api.example.com")
        .cache(CacheManager::in_memory(), CachePolicy::default())
        .build()
        .unwrap();

    let err = client.get("/report").send().await.unwrap_err();
    assert_eq!(err.status(), Some(StatusCode::NOT_FOUND));

    let ok = client.get("/report").send().await.unwrap();
    assert_eq!(ok.data.as_json(), Some(&json!({"ready": true})));
    assert_eq!(mock.calls_to("/report"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_server_error_retried_to_success() {
    let mock = Arc::new(MockAdapter::new());
    mock.sequence(
        Method::GET,
        "/status/500",
        vec![
            MockReply::status(StatusCode::INTERNAL_SERVER_ERROR),
            MockReply::json(StatusCode::OK, &json!({"recovered": true})),
        ],
    );
    let client = client_with(&mock);

    let response = client
        .get("/status/500")
        .retry(fast_retry())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(mock.calls_to("/status/500"), 2);
    let retried = &mock.requests()[1];
    assert_eq!(retried.headers["x-retry-attempt"], "1");
}

#[tokio::test(start_paused = true)]
async fn test_two_unavailable_then_ok_takes_three_calls() {
    let mock = Arc::new(MockAdapter::new());
    mock.sequence(
        Method::GET,
        "/flaky",
        vec![
            MockReply::status(StatusCode::SERVICE_UNAVAILABLE),
            MockReply::status(StatusCode::SERVICE_UNAVAILABLE),
            MockReply::status(StatusCode::OK),
        ],
    );
    let client = client_with(&mock);

    let response = client.get("/flaky").retry(fast_retry()).send().await.unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(mock.calls_to("/flaky"), 3);
}

#[tokio::test(start_paused = true)]
async fn test_not_found_is_not_retried() {
    let mock = Arc::new(MockAdapter::new());
    mock.reply(Method::GET, "/missing", MockReply::status(StatusCode::NOT_FOUND));
    let client = client_with(&mock);

    let err = client
        .get("/missing")
        .retry(fast_retry())
        .send()
        .await
        .unwrap_err();

    assert_eq!(err.code(), ErrorCode::BadResponse);
    assert_eq!(err.status(), Some(StatusCode::NOT_FOUND));
    assert!(err.response().is_some());
    assert_eq!(mock.calls_to("/missing"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_network_errors_are_retried() {
    let mock = Arc::new(MockAdapter::new());
    mock.sequence(
        Method::GET,
        "/wobbly",
        vec![
            MockReply::network_error("connection reset"),
            MockReply::status(StatusCode::OK),
        ],
    );
    let client = client_with(&mock);

    let response = client.get("/wobbly").retry(fast_retry()).send().await.unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(mock.calls_to("/wobbly"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_breaker_opens_and_short_circuits() {
    let mock = Arc::new(MockAdapter::new());
    mock.reply(Method::GET, "/down", MockReply::status(StatusCode::BAD_GATEWAY));
    let client = client_with(&mock);

    let breaker = CircuitBreakerConfig {
        minimum_requests: 2,
        ..CircuitBreakerConfig::default()
    };
    let policy = RetryPolicy::none().with_circuit_breaker(breaker);

    for _ in 0..2 {
        let err = client.get("/down").retry(policy.clone()).send().await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadResponse);
    }

    let err = client.get("/down").retry(policy).send().await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::CircuitOpen);
    assert_eq!(mock.calls_to("/down"), 2);

    let stats = client.breakers().stats();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].1.state, CircuitState::Open);
}

#[tokio::test]
async fn test_interceptor_order_and_eject() {
    let mock = Arc::new(MockAdapter::new());
    mock.reply(Method::GET, "/trace", MockReply::status(StatusCode::OK));
    let client = client_with(&mock);
    let order = Arc::new(Mutex::new(Vec::new()));

    let tag = |label: &'static str, order: &Arc<Mutex<Vec<&'static str>>>| {
        let order = Arc::clone(order);
        Interceptor::new().fulfilled(move |config: RequestConfig| {
            order.lock().push(label);
            Ok(config)
        })
    };
    client.interceptors().request.register(tag("first", &order));
    let ejected = client.interceptors().request.register(tag("second", &order));
    client.interceptors().request.register(tag("third", &order));

    let response_order = Arc::clone(&order);
    client
        .interceptors()
        .response
        .register(Interceptor::new().fulfilled(move |response: Response| {
            response_order.lock().push("response");
            Ok(response)
        }));

    assert!(client.interceptors().request.eject(ejected));
    assert!(!client.interceptors().request.eject(ejected));

    client.get("/trace").send().await.unwrap();
    assert_eq!(*order.lock(), vec!["first", "third", "response"]);
}

#[tokio::test]
async fn test_request_interceptor_can_rewrite_config() {
    let mock = Arc::new(MockAdapter::new());
    mock.reply(Method::GET, "/secure", MockReply::status(StatusCode::OK));
    let client = client_with(&mock);

    client
        .interceptors()
        .request
        .register(Interceptor::new().fulfilled(|config: RequestConfig| {
            Ok(config.with_header(
                HeaderName::from_static("authorization"),
                HeaderValue::from_static("Bearer token-123"),
            ))
        }));

    client.get("/secure").send().await.unwrap();
    assert_eq!(mock.requests()[0].headers["authorization"], "Bearer token-123");
}

#[tokio::test]
async fn test_conditional_interceptor_runs_only_when_matching() {
    let mock = Arc::new(MockAdapter::new());
    mock.reply(Method::GET, "/a", MockReply::status(StatusCode::OK));
    mock.reply(Method::POST, "/a", MockReply::status(StatusCode::OK));
    let client = client_with(&mock);

    client.interceptors().request.register(
        Interceptor::new()
            .fulfilled(|config: RequestConfig| {
                Ok(config.with_header(
                    HeaderName::from_static("x-mutation"),
                    HeaderValue::from_static("1"),
                ))
            })
            .run_when(|config: &RequestConfig| config.method() == Method::POST),
    );

    client.get("/a").send().await.unwrap();
    client.post("/a").send().await.unwrap();

    let requests = mock.requests();
    assert!(!requests[0].headers.contains_key("x-mutation"));
    assert_eq!(requests[1].headers["x-mutation"], "1");
}

#[tokio::test]
async fn test_response_rejected_handler_recovers() {
    let mock = Arc::new(MockAdapter::new());
    mock.reply(Method::GET, "/gone", MockReply::status(StatusCode::GONE));
    let client = client_with(&mock);

    client
        .interceptors()
        .response
        .register(Interceptor::new().rejected(|err: HttpError| {
            match err.into_response() {
                Some(response) if response.status == StatusCode::GONE => {
                    Ok(response.with_data(ResponseData::Json(json!({"fallback": true}))))
                }
                Some(response) => Err(HttpError::bad_status(response)),
                None => Err(HttpError::config("no response")),
            }
        }));

    let response = client.get("/gone").send().await.unwrap();
    assert_eq!(response.status, StatusCode::GONE);
    assert_eq!(response.data.as_json(), Some(&json!({"fallback": true})));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_in_flight_request() {
    let mock = Arc::new(MockAdapter::new());
    mock.reply(
        Method::GET,
        "/slow",
        MockReply::status(StatusCode::OK).with_delay(Duration::from_secs(30)),
    );
    let client = client_with(&mock);
    let source = CancelToken::source();

    let canceller = source.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel("user navigated away");
    });

    let err = client
        .get("/slow")
        .cancel_token(source.token())
        .send()
        .await
        .unwrap_err();

    assert!(err.is_cancel());
    assert_eq!(err.code(), ErrorCode::Cancelled);
    assert_eq!(err.cancel_reason().unwrap().message(), "user navigated away");
}

#[tokio::test]
async fn test_already_cancelled_token_never_reaches_transport() {
    let mock = Arc::new(MockAdapter::new());
    mock.reply(Method::GET, "/never", MockReply::status(StatusCode::OK));
    let client = client_with(&mock);
    let source = CancelToken::source();
    source.cancel("too late");

    let err = client
        .get("/never")
        .cancel_token(source.token())
        .send()
        .await
        .unwrap_err();

    assert!(err.is_cancel());
    assert_eq!(mock.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_maps_to_timeout_code() {
    let mock = Arc::new(MockAdapter::new());
    mock.reply(
        Method::GET,
        "/sleepy",
        MockReply::status(StatusCode::OK).with_delay(Duration::from_secs(10)),
    );
    let client = client_with(&mock);

    let err = client
        .get("/sleepy")
        .timeout(Duration::from_secs(1))
        .send()
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Timeout);
    assert!(err.config_ref().is_some());
}

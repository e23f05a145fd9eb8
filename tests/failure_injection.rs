//! Failure injection tests for the backend dispatch.

use std::sync::Arc;
use std::time::Duration;

use waygate::load_balancer::{LbEndpoint, RoundRobin};
use waygate::proxy::Params;
use waygate::resilience::{BreakerRegistry, BreakerSettings};
use waygate::routing::{BackendKind, Route, RouteTable};

mod common;

fn lb_route(endpoints: Vec<Arc<LbEndpoint>>) -> RouteTable {
    let mut table = RouteTable::new();
    table.add(
        None,
        Some("/".into()),
        0,
        Arc::new(Route::new(
            "pool",
            BackendKind::LoadBalanced {
                algorithm: Arc::new(RoundRobin::new()),
                endpoints,
            },
        )),
    );
    table.build()
}

#[tokio::test]
async fn lb_dial_failure_retries_on_the_other_endpoint() {
    let dead = common::closed_port().await;
    let live = common::start_mock_backend("alive").await;

    // Round robin starts at the first endpoint, so the dead one is dialed
    // first and the retry must land on the live one.
    let table = lb_route(vec![
        Arc::new(LbEndpoint::new("http", dead.to_string())),
        Arc::new(LbEndpoint::new("http", live.to_string())),
    ]);
    let proxy = common::spawn_proxy(Params {
        route_lookup: Arc::new(table),
        ..Default::default()
    })
    .await;

    let rsp = common::test_client()
        .get(format!("http://{proxy}/x"))
        .send()
        .await
        .unwrap();
    assert_eq!(rsp.status(), 200);
    assert_eq!(rsp.text().await.unwrap(), "alive");
}

#[tokio::test]
async fn lb_retry_reports_failure_then_success_to_the_breaker() {
    let dead = common::closed_port().await;
    let live = common::start_mock_backend("alive").await;

    // Threshold of two: the first attempt's failure report must be
    // followed by the retry's success report, which resets the counter
    // and keeps the circuit closed across repeated requests.
    let breakers = Arc::new(BreakerRegistry::new(Some(BreakerSettings {
        host: String::new(),
        failures: 2,
        timeout: Duration::from_secs(60),
    })));

    let table = lb_route(vec![
        Arc::new(LbEndpoint::new("http", dead.to_string())),
        Arc::new(LbEndpoint::new("http", live.to_string())),
    ]);
    let proxy = common::spawn_proxy(Params {
        route_lookup: Arc::new(table),
        breakers: Some(breakers),
        ..Default::default()
    })
    .await;

    let client = common::test_client();
    for _ in 0..4 {
        let rsp = client
            .get(format!("http://{proxy}/x"))
            .send()
            .await
            .unwrap();
        assert_eq!(rsp.status(), 200, "circuit must stay closed");
    }
}

#[tokio::test]
async fn requests_with_a_body_are_not_retried() {
    let dead = common::closed_port().await;
    let live = common::start_mock_backend("alive").await;

    let table = lb_route(vec![
        Arc::new(LbEndpoint::new("http", dead.to_string())),
        Arc::new(LbEndpoint::new("http", live.to_string())),
    ]);
    let proxy = common::spawn_proxy(Params {
        route_lookup: Arc::new(table),
        ..Default::default()
    })
    .await;

    let rsp = common::test_client()
        .post(format!("http://{proxy}/x"))
        .body("not replayable")
        .send()
        .await
        .unwrap();
    assert_eq!(rsp.status(), 502, "dial failure with a body surfaces as-is");
}

#[tokio::test]
async fn static_dial_failure_is_a_502_without_retry() {
    let dead = common::closed_port().await;

    let mut table = RouteTable::new();
    table.add(
        None,
        Some("/".into()),
        0,
        Arc::new(Route::new(
            "static",
            BackendKind::Static {
                scheme: "http".into(),
                host: dead.to_string(),
            },
        )),
    );
    let proxy = common::spawn_proxy(Params {
        route_lookup: Arc::new(table.build()),
        ..Default::default()
    })
    .await;

    let rsp = common::test_client()
        .get(format!("http://{proxy}/x"))
        .send()
        .await
        .unwrap();
    assert_eq!(rsp.status(), 502);
}

#[tokio::test]
async fn backend_5xx_is_streamed_not_translated() {
    let backend =
        common::start_programmable_backend(|_| async { (503, "overloaded".to_string()) }).await;

    let mut table = RouteTable::new();
    table.add(
        None,
        Some("/".into()),
        0,
        Arc::new(Route::new(
            "static",
            BackendKind::Static {
                scheme: "http".into(),
                host: backend.to_string(),
            },
        )),
    );
    let proxy = common::spawn_proxy(Params {
        route_lookup: Arc::new(table.build()),
        ..Default::default()
    })
    .await;

    let rsp = common::test_client()
        .get(format!("http://{proxy}/x"))
        .send()
        .await
        .unwrap();
    assert_eq!(rsp.status(), 503);
    assert_eq!(rsp.text().await.unwrap(), "overloaded");
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end tests: runners, reconciliation, routing, schema watches and
//! reapers working together over one store.

mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use futures::StreamExt;
use helmsman_model::Labels;
use helmsman_model::schema::VerbRef;
use serde_json::{Value, json};
use tower::ServiceExt;

use common::{TestContext, echo_module, wait_for};
use helmsman_controller::ControllerRuntime;
use helmsman_controller::persistence::SqlitePersistence;
use helmsman_controller::reaper::{ReapTarget, Reaper, ReaperConfig};
use helmsman_controller::reconciler::Action;
use helmsman_controller::runner::{CallContext, CallRequest, MockFleet};
use helmsman_controller::schema_notifier::{ChangeType, SchemaChange, SchemaWatch};
use helmsman_controller::types::{DeploymentArtefact, RunnerState};

const EVENT_TIMEOUT: Duration = Duration::from_secs(2);

async fn next_change(watch: &mut SchemaWatch) -> SchemaChange {
    tokio::time::timeout(EVENT_TIMEOUT, watch.next())
        .await
        .expect("Timed out waiting for schema change")
        .expect("Schema watch closed")
        .expect("Schema watch failed")
}

async fn assert_quiet(watch: &mut SchemaWatch) {
    let next = tokio::time::timeout(Duration::from_millis(100), watch.next()).await;
    assert!(next.is_err(), "unexpected schema change: {next:?}");
}

#[tokio::test]
async fn test_scale_up_route_and_scale_down() {
    let ctx = TestContext::new().await;
    let a = ctx.add_runner(9601).await;
    let b = ctx.add_runner(9602).await;
    let key = ctx.create_echo_deployment(b"echo v1").await;
    ctx.dal.replace_deployment(&key, 2).await.unwrap();

    let reconciler = ctx.reconciler();
    for _ in 0..2 {
        let actions = reconciler.tick().await.unwrap();
        assert!(matches!(actions.as_slice(), [Action::Deployed(_)]));
    }
    assert!(reconciler.tick().await.unwrap().is_empty());

    let echo = VerbRef::new("echo", "echo");
    assert_eq!(ctx.fleet.serving(&echo).len(), 2);
    for runner in [&a, &b] {
        let state = ctx.dal.get_runner(&runner.key()).await.unwrap();
        assert_eq!(state.state, RunnerState::Assigned);
        assert_eq!(state.deployment.as_ref(), Some(&key));
    }
    assert_eq!(ctx.dal.routing_table(Some("echo")).await.unwrap().len(), 2);

    for name in ["Ann", "Ben", "Cid", "Dee"] {
        let outcome = ctx
            .state
            .dispatcher
            .call(
                CallRequest {
                    verb: echo.clone(),
                    body: json!({"name": name}),
                },
                CallContext::default(),
                "127.0.0.1",
            )
            .await
            .unwrap();
        assert_eq!(
            serde_json::to_value(&outcome.response).unwrap(),
            json!({"body": {"message": format!("Hello, {name}!")}})
        );
    }
    assert_eq!(a.calls().len() + b.calls().len(), 4);

    ctx.dal.set_deployment_replicas(&key, 0).await.unwrap();
    for _ in 0..2 {
        let actions = reconciler.tick().await.unwrap();
        assert!(matches!(actions.as_slice(), [Action::Terminated(_)]));
    }
    assert!(ctx.fleet.serving(&echo).is_empty());
    for runner in [&a, &b] {
        let state = ctx.dal.get_runner(&runner.key()).await.unwrap();
        assert_eq!(state.state, RunnerState::Idle);
        assert!(state.deployment.is_none());
    }
    assert!(ctx.dal.routing_table(Some("echo")).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_reconciler_skips_runners_of_other_languages() {
    let ctx = TestContext::new().await;
    let rust = ctx.fleet.add(Arc::new(
        helmsman_controller::runner::MockRunner::new("http://127.0.0.1:9611", "go")
            .with_labels(Labels::for_language("rust")),
    ));
    ctx.dal.upsert_runner(&rust.heartbeat()).await.unwrap();
    let key = ctx.create_echo_deployment(b"echo v1").await;
    ctx.dal.replace_deployment(&key, 1).await.unwrap();

    let reconciler = ctx.reconciler();
    assert!(reconciler.tick().await.unwrap().is_empty());
    assert_eq!(rust.heartbeat().state, RunnerState::Idle);

    ctx.add_runner(9612).await;
    let actions = reconciler.tick().await.unwrap();
    assert!(matches!(actions.as_slice(), [Action::Deployed(_)]));
    assert_eq!(rust.heartbeat().state, RunnerState::Idle);
}

#[tokio::test]
async fn test_schema_watch_follows_deployment_lifecycle() {
    let ctx = TestContext::new().await;
    let mut watch = ctx.state.notifier.watch().await.unwrap();
    assert_quiet(&mut watch).await;

    let v1 = ctx.create_echo_deployment(b"echo v1").await;
    assert_quiet(&mut watch).await;

    ctx.dal.set_deployment_replicas(&v1, 1).await.unwrap();
    let added = next_change(&mut watch).await;
    assert_eq!(added.change_type, ChangeType::Added);
    assert_eq!(added.module_name, "echo");
    assert_eq!(added.deployment_key, v1);
    let schema = added.schema.unwrap();
    assert_eq!(schema.runtime.unwrap().min_replicas, 1);

    let v2 = ctx.create_echo_deployment(b"echo v2").await;
    ctx.dal.replace_deployment(&v2, 1).await.unwrap();
    let changed = next_change(&mut watch).await;
    assert_eq!(changed.change_type, ChangeType::Changed);
    assert_eq!(changed.deployment_key, v2);
    assert_quiet(&mut watch).await;

    ctx.dal.set_deployment_replicas(&v2, 3).await.unwrap();
    let scaled = next_change(&mut watch).await;
    assert_eq!(scaled.change_type, ChangeType::Changed);
    assert_eq!(scaled.schema.unwrap().runtime.unwrap().min_replicas, 3);

    ctx.dal.set_deployment_replicas(&v2, 0).await.unwrap();
    let removed = next_change(&mut watch).await;
    assert_eq!(removed.change_type, ChangeType::Removed);
    assert_eq!(removed.deployment_key, v2);
}

#[tokio::test]
async fn test_schema_watch_catches_up_on_open() {
    let ctx = TestContext::new().await;
    let key = ctx.create_echo_deployment(b"echo v1").await;
    ctx.dal.set_deployment_replicas(&key, 1).await.unwrap();

    let mut other = echo_module();
    other.name = "greeter".to_string();
    let digest = ctx.dal.create_artefact(b"greeter").await.unwrap();
    let greeter = ctx
        .dal
        .create_deployment(
            "go",
            &other,
            &[DeploymentArtefact {
                digest,
                path: "main".to_string(),
                executable: true,
            }],
        )
        .await
        .unwrap();
    ctx.dal.set_deployment_replicas(&greeter, 1).await.unwrap();

    let mut watch = ctx.state.notifier.watch().await.unwrap();
    let first = next_change(&mut watch).await;
    let second = next_change(&mut watch).await;
    assert!(first.more);
    assert!(!second.more);
    let mut modules = vec![first.module_name, second.module_name];
    modules.sort();
    assert_eq!(modules, vec!["echo", "greeter"]);
    assert!(
        [first.change_type, second.change_type]
            .iter()
            .all(|t| *t == ChangeType::Added)
    );
    assert_quiet(&mut watch).await;
}

#[tokio::test]
async fn test_schema_pull_streams_ndjson() {
    let ctx = TestContext::new().await;
    let key = ctx.create_echo_deployment(b"echo v1").await;
    ctx.dal.set_deployment_replicas(&key, 1).await.unwrap();

    let response = ctx
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/schema/pull")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let mut body = response.into_body().into_data_stream();
    let mut buffer = Vec::new();
    let mut lines: Vec<Value> = Vec::new();
    let dal = ctx.dal.clone();
    let mut scaled = false;
    while lines.len() < 2 {
        let chunk = tokio::time::timeout(EVENT_TIMEOUT, body.next())
            .await
            .expect("Timed out waiting for schema line")
            .expect("Schema stream ended")
            .unwrap();
        buffer.extend_from_slice(&chunk);
        while let Some(end) = buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=end).collect();
            lines.push(serde_json::from_slice(&line).unwrap());
        }
        if !scaled && !lines.is_empty() {
            dal.set_deployment_replicas(&key, 0).await.unwrap();
            scaled = true;
        }
    }

    assert_eq!(lines[0]["change_type"], "added");
    assert_eq!(lines[0]["deployment_key"], key.to_string());
    assert_eq!(lines[0]["more"], false);
    assert_eq!(lines[1]["change_type"], "removed");
}

#[tokio::test]
async fn test_expired_reservation_is_released() {
    let ctx = TestContext::new().await;
    let runner = ctx.add_runner(9621).await;
    let key = ctx.create_echo_deployment(b"echo v1").await;

    let reservation = ctx
        .dal
        .reserve(&key, Duration::from_millis(1), &Labels::for_language("go"))
        .await
        .unwrap();
    assert_eq!(reservation.runner().key, runner.key());
    reservation.commit().await.unwrap();
    assert_eq!(
        ctx.dal.get_runner(&runner.key()).await.unwrap().state,
        RunnerState::Reserved
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    let reaper = Reaper::new(ctx.dal.clone(), ReapTarget::Reservations, ReaperConfig::default());
    assert_eq!(reaper.reap().await.unwrap(), 1);

    let released = ctx.dal.get_runner(&runner.key()).await.unwrap();
    assert_eq!(released.state, RunnerState::Idle);
    assert!(released.deployment.is_none());
    assert_eq!(reaper.reap().await.unwrap(), 0);
}

#[tokio::test]
async fn test_dead_runners_drop_out_of_routing() {
    let ctx = TestContext::new().await;
    ctx.add_runner(9631).await;
    let key = ctx.create_echo_deployment(b"echo v1").await;
    ctx.dal.replace_deployment(&key, 1).await.unwrap();
    ctx.reconciler().tick().await.unwrap();
    assert_eq!(ctx.dal.routing_table(None).await.unwrap().len(), 1);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let reaper = Reaper::new(
        ctx.dal.clone(),
        ReapTarget::Runners,
        ReaperConfig {
            heartbeat_timeout: Duration::from_millis(10),
            ..ReaperConfig::default()
        },
    );
    assert_eq!(reaper.reap().await.unwrap(), 1);

    assert!(ctx.dal.routing_table(None).await.unwrap().is_empty());
    let (status, _) = ctx
        .send(
            "POST",
            "/call",
            Some(json!({"verb": "echo.echo", "body": {"name": "Eve"}})),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let reconciliation = ctx.dal.deployments_needing_reconciliation().await.unwrap();
    assert_eq!(reconciliation.len(), 1);
    assert_eq!(reconciliation[0].assigned_replicas, 0);
}

#[tokio::test]
async fn test_file_backed_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("helmsman.db");

    let key = {
        let persistence = SqlitePersistence::from_path(&path).await.unwrap();
        let ctx = TestContext::with_persistence(Arc::new(persistence));
        let key = ctx.create_echo_deployment(b"echo v1").await;
        ctx.dal.set_deployment_replicas(&key, 2).await.unwrap();
        key
    };

    let persistence = SqlitePersistence::from_path(&path).await.unwrap();
    let ctx = TestContext::with_persistence(Arc::new(persistence));
    let deployment = ctx.dal.get_deployment(&key).await.unwrap();
    assert_eq!(deployment.min_replicas, 2);
    assert_eq!(deployment.schema, echo_module());
    assert_eq!(deployment.artefacts.len(), 1);

    let chunk = ctx
        .dal
        .artefact_chunk(&deployment.artefacts[0].digest, 0, 1024)
        .await
        .unwrap();
    assert_eq!(chunk, b"echo v1");
}

#[tokio::test]
async fn test_runtime_serves_http() {
    let persistence = SqlitePersistence::connect("sqlite::memory:", 1).await.unwrap();
    let runtime = ControllerRuntime::builder()
        .persistence(Arc::new(persistence))
        .client_factory(Arc::new(MockFleet::new()))
        .bind_addr("127.0.0.1:0".parse().unwrap())
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();

    let base = format!("http://{}", runtime.bind_addr());
    let client = reqwest::Client::new();
    let ping: Value = client
        .get(format!("{base}/ping"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(ping, json!({}));

    let state = runtime.state().clone();
    assert!(
        wait_for(Duration::from_secs(2), || {
            let state = state.clone();
            async move {
                state
                    .dal
                    .list_controllers(false)
                    .await
                    .is_ok_and(|c| c.len() == 1)
            }
        })
        .await
    );

    let status: Value = client
        .get(format!("{base}/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["controllers"].as_array().unwrap().len(), 1);

    let response = client
        .post(format!("{base}/call"))
        .json(&json!({"verb": "echo.echo", "body": {}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 404);

    runtime.shutdown().await.unwrap();
    assert!(client.get(format!("{base}/ping")).send().await.is_err());
}

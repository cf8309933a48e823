//! End-to-end scenarios: authentication failure and duplicate-identity
//! rejection, both of which must finish the connect attempt without
//! ever promoting the session to `Running`.

use std::time::Duration;

use yogi_core::config::BranchConfigJson;
use yogi_core::error::YogiError;
use yogi_core::manager::EVENT_ALL;
use yogi_core::{BranchConfig, BranchEvent};

fn cfg(
    name: &str,
    path: Option<&str>,
    network_name: &str,
    password: &str,
    adv_port: u16,
) -> BranchConfig {
    BranchConfig::from_json(BranchConfigJson {
        name: Some(name.to_string()),
        path: path.map(str::to_string),
        network_name: Some(network_name.to_string()),
        network_password: Some(password.to_string()),
        advertising_address: Some("239.255.0.1".to_string()),
        advertising_port: Some(adv_port),
        advertising_interval: Some(0.05),
        ..Default::default()
    })
    .unwrap()
}

async fn next_event(branch: &yogi_core::Branch) -> BranchEvent {
    branch
        .await_event(EVENT_ALL)
        .await
        .await
        .expect("await_event channel closed")
        .expect("branch event error")
}

/// Drains events until a `connect-finished` for `peer` arrives, asserting
/// that no `connection-lost` for it is ever seen first.
async fn wait_for_connect_finished(branch: &yogi_core::Branch, peer: uuid::Uuid) -> i32 {
    loop {
        match next_event(branch).await {
            BranchEvent::ConnectFinished { uuid, result_code } if uuid == peer => {
                return result_code
            }
            BranchEvent::ConnectionLost { uuid, .. } if uuid == peer => {
                panic!("unexpected connection-lost before connect-finished settled")
            }
            _ => {}
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn password_mismatch_reports_without_connection_loss() {
    let port = 44011;
    let a = yogi_core::Branch::create(cfg("a", None, "net", "a", port))
        .await
        .unwrap();
    let b = yogi_core::Branch::create(cfg("b", None, "net", "b", port))
        .await
        .unwrap();

    let result_code = tokio::time::timeout(
        Duration::from_secs(5),
        wait_for_connect_finished(&a, b.uuid()),
    )
    .await
    .expect("connect-finished did not arrive in time");

    assert_eq!(result_code, YogiError::PasswordMismatch(None).code());

    // No connection-lost should follow; give the runtime a moment to
    // prove it stays quiet.
    let extra = tokio::time::timeout(Duration::from_millis(300), next_event(&a)).await;
    if let Ok(BranchEvent::ConnectionLost { uuid, .. }) = extra {
        if uuid == b.uuid() {
            panic!("connection-lost fired after a password-mismatch connect-finished");
        }
    }

    a.destroy().await;
    b.destroy().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_name_and_path_rejected_on_both_sides() {
    let port = 44012;
    let a = yogi_core::Branch::create(cfg("same", Some("/same"), "net", "", port))
        .await
        .unwrap();
    let b = yogi_core::Branch::create(cfg("same", Some("/same"), "net", "", port))
        .await
        .unwrap();

    let code = tokio::time::timeout(
        Duration::from_secs(5),
        wait_for_connect_finished(&a, b.uuid()),
    )
    .await
    .expect("connect-finished did not arrive in time");

    assert!(
        code == YogiError::DuplicateBranchName(None).code()
            || code == YogiError::DuplicateBranchPath(None).code()
    );

    a.destroy().await;
    b.destroy().await;
}

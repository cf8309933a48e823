//! End-to-end scenario: two branches discover each other over loopback
//! multicast, complete the handshake, and agree on a session.

use std::time::Duration;

use yogi_core::config::BranchConfigJson;
use yogi_core::manager::EVENT_ALL;
use yogi_core::{BranchConfig, BranchEvent};

fn cfg(name: &str, network_name: &str, password: &str, adv_port: u16) -> BranchConfig {
    BranchConfig::from_json(BranchConfigJson {
        name: Some(name.to_string()),
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

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn discovery_then_session_within_five_seconds() {
    let port = 44010;
    let a = yogi_core::Branch::create(cfg("a", "net", "", port)).await.unwrap();
    let b = yogi_core::Branch::create(cfg("b", "net", "", port)).await.unwrap();

    let run = async {
        let discovered = next_event(&a).await;
        let discovered_uuid = match discovered {
            BranchEvent::Discovered { uuid, .. } => uuid,
            other => panic!("expected branch-discovered, got {other:?}"),
        };
        assert_eq!(discovered_uuid, b.uuid());

        let queried = next_event(&a).await;
        match queried {
            BranchEvent::Queried { uuid, .. } => assert_eq!(uuid, b.uuid()),
            other => panic!("expected branch-queried, got {other:?}"),
        }

        let finished = next_event(&a).await;
        match finished {
            BranchEvent::ConnectFinished { uuid, result_code } => {
                assert_eq!(uuid, b.uuid());
                assert_eq!(result_code, 0);
            }
            other => panic!("expected connect-finished, got {other:?}"),
        }
    };

    tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("discovery and handshake did not complete in time");

    a.destroy().await;
    b.destroy().await;
}

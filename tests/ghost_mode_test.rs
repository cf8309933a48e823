//! A ghost-mode branch observes and is queried like any other peer,
//! but it never authenticates and must never show up as a running
//! connection on either side.

use std::time::Duration;

use yogi_core::config::BranchConfigJson;
use yogi_core::manager::EVENT_ALL;
use yogi_core::{BranchConfig, BranchEvent};

fn cfg(name: &str, network_name: &str, adv_port: u16, ghost_mode: bool) -> BranchConfig {
    BranchConfig::from_json(BranchConfigJson {
        name: Some(name.to_string()),
        network_name: Some(network_name.to_string()),
        network_password: Some(String::new()),
        advertising_address: Some("239.255.0.1".to_string()),
        advertising_port: Some(adv_port),
        advertising_interval: Some(0.05),
        ghost_mode: Some(ghost_mode),
        ..Default::default()
    })
    .unwrap()
}

async fn next_matching_queried(branch: &yogi_core::Branch, peer: uuid::Uuid) -> BranchEvent {
    loop {
        let event = branch
            .await_event(EVENT_ALL)
            .await
            .await
            .expect("await_event channel closed")
            .expect("branch event error");
        if let BranchEvent::Queried { uuid, .. } = &event {
            if *uuid == peer {
                return event;
            }
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ghost_branch_never_promotes_but_still_gets_queried() {
    let port = 44012;
    let normal = yogi_core::Branch::create(cfg("normal", "net", port, false))
        .await
        .unwrap();
    let ghost = yogi_core::Branch::create(cfg("ghost", "net", port, true))
        .await
        .unwrap();

    let run = async {
        match next_matching_queried(&normal, ghost.uuid()).await {
            BranchEvent::Queried { uuid, .. } => assert_eq!(uuid, ghost.uuid()),
            other => panic!("expected branch-queried, got {other:?}"),
        }
    };
    tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("normal branch never queried the ghost");

    // Ghost mode skips authentication entirely, so neither side ever
    // promotes the connection to Running.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(normal.connected_branches().await.is_empty());
    assert!(ghost.connected_branches().await.is_empty());

    normal.destroy().await;
    ghost.destroy().await;
}

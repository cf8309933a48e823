//! Two branches that discover each other over loopback multicast will
//! typically dial each other simultaneously; the tie-break in
//! `connection::keeps_priority` must leave each side with exactly one
//! running connection to the other, not zero and not two.

use std::time::Duration;

use yogi_core::config::BranchConfigJson;
use yogi_core::BranchConfig;

fn cfg(name: &str, network_name: &str, adv_port: u16) -> BranchConfig {
    BranchConfig::from_json(BranchConfigJson {
        name: Some(name.to_string()),
        network_name: Some(network_name.to_string()),
        network_password: Some(String::new()),
        advertising_address: Some("239.255.0.1".to_string()),
        advertising_port: Some(adv_port),
        advertising_interval: Some(0.05),
        ..Default::default()
    })
    .unwrap()
}

async fn wait_for_one_connection(
    branch: &yogi_core::Branch,
) -> Vec<(uuid::Uuid, yogi_core::BranchInfo)> {
    loop {
        let connected = branch.connected_branches().await;
        if connected.len() == 1 {
            return connected;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn simultaneous_dial_race_keeps_exactly_one_connection_per_side() {
    let port = 44011;
    let a = yogi_core::Branch::create(cfg("a", "net", port)).await.unwrap();
    let b = yogi_core::Branch::create(cfg("b", "net", port)).await.unwrap();

    let run = async {
        let a_connected = wait_for_one_connection(&a).await;
        let b_connected = wait_for_one_connection(&b).await;

        assert_eq!(a_connected.len(), 1);
        assert_eq!(b_connected.len(), 1);
        assert_eq!(a_connected[0].0, b.uuid());
        assert_eq!(b_connected[0].0, a.uuid());
    };

    tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("discovery and handshake did not complete in time");

    // Give any duplicate (lower-priority) connection attempt from the
    // other half of the race time to settle and be torn down; the
    // winning side's count must not move off of 1.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(a.connected_branches().await.len(), 1);
    assert_eq!(b.connected_branches().await.len(), 1);

    a.destroy().await;
    b.destroy().await;
}

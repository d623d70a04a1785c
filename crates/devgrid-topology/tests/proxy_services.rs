//! Proxy services against a live owner endpoint.
//!
//! Each test spawns an owner `NodeEndpoint` backed by a `SimulatedDevice`
//! and drives it through the follower-side proxies.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use devgrid_endpoint::{Context, Endpoint, EndpointSystem, ReplyTo};
use devgrid_state::DeviceConfig;
use devgrid_topology::endpoints::NodeEndpoint;
use devgrid_topology::payload::*;
use devgrid_topology::services::*;
use devgrid_topology::*;
use serde_json::json;

const ASK_TIMEOUT: Duration = Duration::from_secs(5);

fn setup(write_tx_idle_timeout: Option<Duration>) -> DeviceSetup {
    let settings = TopologySettings {
        write_tx_idle_timeout,
        ..TopologySettings::default()
    };
    DeviceSetup::new(&settings, DeviceConfig::new("dev-1", "192.0.2.1", 830))
}

/// Spawn an initialized owner on node-2 and return proxies bound to it.
async fn owner_with_proxies(device: &SimulatedDevice, setup: DeviceSetup) -> DeviceServices {
    let system: DeviceEndpointSystem = EndpointSystem::new("node-2");
    let owner = system
        .spawn("dev-1_master_node-2", NodeEndpoint::owner(setup.clone()))
        .unwrap();
    let reply = owner
        .ask(
            Message::CreateInitialMasterActorData {
                services: device.services(),
                source_ids: device.source_ids(),
            },
            ASK_TIMEOUT,
        )
        .await
        .unwrap();
    assert!(matches!(reply, Message::MasterActorDataInitialized));
    proxy_services(owner, setup.identity(), ASK_TIMEOUT)
}

/// Counts every message it receives and never answers.
struct Counting(Arc<AtomicUsize>);

#[async_trait]
impl Endpoint<Message> for Counting {
    async fn handle(&mut self, _ctx: &mut Context<Message>, _message: Message, _reply: Option<ReplyTo<Message>>) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

struct NoopListener;

impl RpcAvailabilityListener for NoopListener {
    fn on_rpcs_available(&self, _rpcs: &[QName]) {}
}

#[tokio::test]
async fn rpc_empty_result_is_absent_not_error() {
    let device = SimulatedDevice::new("dev-1");
    device.set_rpc_reply("reset", CannedReply::Reply(None));
    let services = owner_with_proxies(&device, setup(None)).await;

    let result = services
        .rpc
        .invoke_rpc(&QName::new("dev-ops", "reset"), None)
        .await
        .unwrap();
    assert!(result.is_none());
    assert_eq!(device.rpc_invocations(), 1);
}

#[tokio::test]
async fn rpc_reply_and_failure_are_mapped() {
    let device = SimulatedDevice::new("dev-1");
    device.set_rpc_reply("reboot", CannedReply::Fail("device busy".to_string()));
    let services = owner_with_proxies(&device, setup(None)).await;

    let echoed = services
        .rpc
        .invoke_rpc(&QName::new("dev-ops", "ping"), Some(json!({"count": 3})))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(echoed.value, Some(json!({"count": 3})));

    let err = services
        .rpc
        .invoke_rpc(&QName::new("dev-ops", "reboot"), None)
        .await
        .unwrap_err();
    assert_eq!(err, ServiceError::Rpc("device busy".to_string()));
}

#[tokio::test]
async fn action_empty_result_and_failure() {
    let device = SimulatedDevice::new("dev-1");
    device.set_action_reply("clear", CannedReply::Reply(None));
    device.set_action_reply("restart", CannedReply::Fail("not permitted".to_string()));
    let services = owner_with_proxies(&device, setup(None)).await;
    let target = DataTreeIdentifier {
        datastore: Datastore::Operational,
        path: YangPath::parse("/interfaces/interface"),
    };

    let cleared = services
        .action
        .invoke_action(
            &SchemaPath(vec![QName::new("if", "interfaces"), QName::new("if", "clear")]),
            &target,
            json!({}),
        )
        .await
        .unwrap();
    assert!(cleared.is_none());

    let err = services
        .action
        .invoke_action(&SchemaPath(vec![QName::new("if", "restart")]), &target, json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Action(_)));
}

#[tokio::test(start_paused = true)]
async fn unsupported_operations_send_nothing() {
    let system: DeviceEndpointSystem = EndpointSystem::new("node-2");
    let received = Arc::new(AtomicUsize::new(0));
    let owner = system
        .spawn("dev-1_master_node-2", Counting(Arc::clone(&received)))
        .unwrap();
    let services = proxy_services(owner, setup(None).identity(), ASK_TIMEOUT);

    let chain = services.data_broker.create_transaction_chain();
    assert!(matches!(chain, Err(ServiceError::Unsupported(_))));
    let listener = services.rpc.register_rpc_listener(Arc::new(NoopListener));
    assert!(matches!(listener, Err(ServiceError::Unsupported(_))));

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(received.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn unreachable_owner_reports_master_down() {
    let system: DeviceEndpointSystem = EndpointSystem::new("node-1");
    let owner = system.resolve(system.user_path("dev-1_master_node-9").unwrap());
    let services = proxy_services(owner, setup(None).identity(), ASK_TIMEOUT);

    let started = tokio::time::Instant::now();
    let err = services
        .rpc
        .invoke_rpc(&QName::new("dev-ops", "ping"), None)
        .await
        .unwrap_err();
    assert!(started.elapsed() >= ASK_TIMEOUT);
    match err {
        ServiceError::Rpc(message) => assert!(message.contains("master is down")),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn write_transaction_commits_on_device() {
    let device = SimulatedDevice::new("dev-1");
    let services = owner_with_proxies(&device, setup(None)).await;
    let path = YangPath::parse("/system/hostname");

    let tx = services.data_broker.new_read_write_transaction().await.unwrap();
    tx.put(Datastore::Configuration, &path, json!({"name": "edge-1"}))
        .await
        .unwrap();
    tx.commit().await.unwrap();
    assert_eq!(
        device.value(Datastore::Configuration, &path),
        Some(json!({"name": "edge-1"}))
    );

    let reader = services.data_broker.new_read_only_transaction().await.unwrap();
    assert!(reader.exists(Datastore::Configuration, &path).await.unwrap());
    assert_eq!(
        reader.read(Datastore::Configuration, &path).await.unwrap(),
        Some(json!({"name": "edge-1"}))
    );
    assert!(
        reader
            .read(Datastore::Operational, &path)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn cancelled_transaction_leaves_device_untouched() {
    let device = SimulatedDevice::new("dev-1");
    let services = owner_with_proxies(&device, setup(None)).await;
    let path = YangPath::parse("/system/ntp");

    let tx = services.data_broker.new_write_only_transaction().await.unwrap();
    tx.merge(Datastore::Configuration, &path, json!({"enabled": true}))
        .await
        .unwrap();
    assert!(tx.cancel().await);
    assert!(device.value(Datastore::Configuration, &path).is_none());
}

#[tokio::test(start_paused = true)]
async fn idle_write_transaction_is_cancelled() {
    let device = SimulatedDevice::new("dev-1");
    let services = owner_with_proxies(&device, setup(Some(Duration::from_secs(10)))).await;
    let path = YangPath::parse("/system/dns");

    let tx = services.data_broker.new_write_only_transaction().await.unwrap();
    tx.put(Datastore::Configuration, &path, json!({"server": "192.0.2.53"}))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(11)).await;

    let err = tx.commit().await.unwrap_err();
    assert!(matches!(err, ServiceError::TransactionFailed(_)));
    assert!(device.value(Datastore::Configuration, &path).is_none());
}

#[tokio::test]
async fn data_tree_edits_apply_on_commit() {
    let device = SimulatedDevice::new("dev-1");
    let services = owner_with_proxies(&device, setup(None)).await;
    let path = YangPath::parse("/interfaces/interface/eth0");

    services.data_tree.lock().await.unwrap();
    services
        .data_tree
        .edit(
            EditOperation::Merge,
            Datastore::Configuration,
            &path,
            Some(json!({"mtu": 9000})),
        )
        .await
        .unwrap();
    services.data_tree.commit().await.unwrap();
    services.data_tree.unlock().await.unwrap();

    let config = services.data_tree.get_config(&path, &[]).await.unwrap();
    assert_eq!(config, Some(json!({"mtu": 9000})));
    assert!(services.data_tree.get(&path, &[]).await.unwrap().is_none());
}

#[tokio::test]
async fn rejected_edit_fails_commit() {
    let device = SimulatedDevice::new("dev-1");
    device.set_fail_edits(true);
    let services = owner_with_proxies(&device, setup(None)).await;
    let path = YangPath::parse("/interfaces/interface/eth1");

    // edits complete locally; the owner reports the failure on commit
    services
        .data_tree
        .edit(
            EditOperation::Replace,
            Datastore::Configuration,
            &path,
            Some(json!({"enabled": false})),
        )
        .await
        .unwrap();
    let err = services.data_tree.commit().await.unwrap_err();
    assert!(matches!(err, ServiceError::DataTree(_)));
    assert!(device.value(Datastore::Configuration, &path).is_none());
}

#[tokio::test]
async fn second_lock_is_denied_through_proxy() {
    let device = SimulatedDevice::new("dev-1");
    let services = owner_with_proxies(&device, setup(None)).await;

    services.data_tree.lock().await.unwrap();
    let err = services.data_tree.lock().await.unwrap_err();
    assert!(matches!(err, ServiceError::DataTree(_)));
}

#[tokio::test(start_paused = true)]
async fn idle_data_tree_session_is_replaced() {
    let device = SimulatedDevice::new("dev-1");
    let services = owner_with_proxies(&device, setup(Some(Duration::from_secs(10)))).await;
    let path = YangPath::parse("/interfaces/interface/eth2");

    services.data_tree.lock().await.unwrap();
    services
        .data_tree
        .edit(
            EditOperation::Merge,
            Datastore::Configuration,
            &path,
            Some(json!({"mtu": 1500})),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(11)).await;

    // the owner discarded the edit and released the lock
    services.data_tree.lock().await.unwrap();
    assert!(services.data_tree.get_config(&path, &[]).await.unwrap().is_none());
    services.data_tree.unlock().await.unwrap();

    // reads outside a lock survive their session idling out too
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert!(services.data_tree.get_config(&path, &[]).await.unwrap().is_none());
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert!(services.data_tree.get_config(&path, &[]).await.unwrap().is_none());
}

#[tokio::test]
async fn schema_sources_come_from_owner() {
    let device = SimulatedDevice::new("dev-1");
    let services = owner_with_proxies(&device, setup(None)).await;

    let id = SourceIdentifier::new("ietf-interfaces", Some("2018-02-20"));
    let source = services.schema.get_source(&id).await.unwrap();
    assert!(source.text.contains("module ietf-interfaces"));

    let missing = services
        .schema
        .get_source(&SourceIdentifier::new("openconfig-bgp", None))
        .await
        .unwrap_err();
    assert!(matches!(missing, ServiceError::SchemaSource(_)));
}

//! Relaying through networking nodes: path recording, forwarding policy,
//! loop rejection and replies crossing plain links

use std::sync::Arc;
use std::time::Duration;

use ocpp_relay_core::{
    ConnectionRole, ErrorCode, FnVoter, ForwardingOutcome, FrameProfile, HandlerError, MemoryNetwork,
    NetworkPath, NetworkingNode, NodeConfig, NodeId, Payload, RejectResponse, ResultCode, SendRequest, Vote,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DataTransferRequest {
    vendor_id: String,
    #[serde(default)]
    data: Option<Value>,
}

fn relay_config() -> NodeConfig {
    NodeConfig::new("LC1")
}

fn relay(network: &Arc<MemoryNetwork>, config: NodeConfig) -> NetworkingNode {
    NetworkingNode::builder(config)
        .register_json::<DataTransferRequest, Value>("DataTransfer")
        .register_json::<Value, Value>("Heartbeat")
        .register_json::<Value, Value>("Reset")
        .build(network.clone())
        .unwrap()
}

fn parse(text: &str) -> Value {
    serde_json::from_str(text).unwrap()
}

#[tokio::test]
async fn test_three_hop_relay_records_path() {
    let network = MemoryNetwork::new();
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();

    let csms = NetworkingNode::builder(NodeConfig::csms("CSMS-1"))
        .handler("Heartbeat", move |ctx, _payload| {
            let seen = seen_tx.clone();
            async move {
                let _ = seen.send((ctx.network_path.clone(), ctx.sender.clone()));
                Payload::json(&json!({"currentTime": "2026-01-20T12:00:00Z"})).map_err(HandlerError::from)
            }
        })
        .build(network.clone())
        .unwrap();
    let controller = relay(&network, relay_config());
    let station = NetworkingNode::builder(NodeConfig::new("CS001"))
        .build(network.clone())
        .unwrap();

    network.link(&station, &controller, FrameProfile::Routed);
    network.link(&controller, &csms, FrameProfile::Routed);

    let response = station.send(SendRequest::new("Heartbeat", Payload::empty())).await;
    assert!(response.is_ok(), "{:?}", response.result);

    let (path, sender) = seen_rx.recv().await.unwrap();
    assert_eq!(
        path,
        NetworkPath::from_hops(vec![NodeId::from("CS001"), NodeId::from("LC1")])
    );
    assert_eq!(sender, NodeId::from("LC1"));

    // The CSMS learned that CS001 sits behind LC1
    let route = csms.route_to(&NodeId::from("CS001")).unwrap();
    assert_eq!(route.peer, NodeId::from("LC1"));
}

#[tokio::test]
async fn test_default_forward_keeps_payload_bytes() {
    let network = MemoryNetwork::new();
    let controller = relay(&network, relay_config());
    let mut station = network.attach_peer(&controller, "CS001", ConnectionRole::Downstream, FrameProfile::Standard);
    let mut csms = network.attach_peer(&controller, "CSMS-1", ConnectionRole::Upstream, FrameProfile::Routed);

    station.inject_text(r#"[2,"f1","DataTransfer",{"vendorId" : "acme", "data":[1,2.50]}]"#);

    let forwarded = csms.recv_text().await.unwrap();
    assert_eq!(
        forwarded,
        r#"[2,"CSMS",["CS001","LC1"],"f1","DataTransfer",{"vendorId" : "acme", "data":[1,2.50]}]"#
    );

    csms.inject_text(r#"[3,"CS001",["CS001","LC1"],"f1",{"status":"Accepted"}]"#);
    assert_eq!(station.recv_text().await.unwrap(), r#"[3,"f1",{"status":"Accepted"}]"#);
}

#[tokio::test]
async fn test_default_reject_answers_filtered() {
    let network = MemoryNetwork::new();
    let controller = relay(
        &network,
        relay_config().with_default_forwarding(ForwardingOutcome::Reject),
    );
    let mut station = network.attach_peer(&controller, "CS001", ConnectionRole::Downstream, FrameProfile::Standard);
    let mut csms = network.attach_peer(&controller, "CSMS-1", ConnectionRole::Upstream, FrameProfile::Routed);

    station.inject_text(r#"[2,"f2","Heartbeat",{}]"#);

    assert_eq!(
        station.recv_text().await.unwrap(),
        r#"[4,"f2","GenericError","Request filtered by networking node policy",{"filtered":true,"node":"LC1"}]"#
    );
    assert!(csms.try_recv().is_none());
}

#[tokio::test]
async fn test_origin_sees_filtered_result() {
    let network = MemoryNetwork::new();
    let csms = NetworkingNode::builder(NodeConfig::csms("CSMS-1"))
        .build(network.clone())
        .unwrap();
    let controller = relay(
        &network,
        relay_config().with_default_forwarding(ForwardingOutcome::Reject),
    );
    let station = NetworkingNode::builder(NodeConfig::new("CS001"))
        .build(network.clone())
        .unwrap();
    network.link(&station, &controller, FrameProfile::Routed);
    network.link(&controller, &csms, FrameProfile::Routed);

    let response = station.send(SendRequest::new("Heartbeat", Payload::empty())).await;

    assert_eq!(response.result.code, ResultCode::Filtered);
    assert_eq!(
        response.result.description.as_deref(),
        Some("Request filtered by networking node policy")
    );
}

#[tokio::test]
async fn test_default_drop_sends_nothing() {
    let network = MemoryNetwork::new();
    let controller = relay(
        &network,
        relay_config().with_default_forwarding(ForwardingOutcome::Drop),
    );
    let mut station = network.attach_peer(&controller, "CS001", ConnectionRole::Downstream, FrameProfile::Standard);
    let mut csms = network.attach_peer(&controller, "CSMS-1", ConnectionRole::Upstream, FrameProfile::Routed);

    controller
        .handle_frame(
            &station.connection,
            ocpp_relay_core::Frame::Text(r#"[2,"f3","Heartbeat",{}]"#.to_string()),
        )
        .await;

    assert!(station.try_recv().is_none());
    assert!(csms.try_recv().is_none());
}

#[tokio::test]
async fn test_voter_rejects_with_typed_inspection() {
    let network = MemoryNetwork::new();
    let controller = relay(&network, relay_config());
    controller.register_voter(Arc::new(FnVoter::new("vendor-filter", 10, |ctx| {
        let request = ctx.parsed_as::<DataTransferRequest>()?;
        if request.vendor_id == "blocked" {
            Some(Vote::reject_with(
                RejectResponse::Result(Payload::json(&json!({"status": "Rejected"})).ok()?),
                "vendor blocked",
            ))
        } else {
            None
        }
    })));
    let mut station = network.attach_peer(&controller, "CS001", ConnectionRole::Downstream, FrameProfile::Standard);
    let mut csms = network.attach_peer(&controller, "CSMS-1", ConnectionRole::Upstream, FrameProfile::Routed);

    station.inject_text(r#"[2,"v1","DataTransfer",{"vendorId":"blocked"}]"#);
    assert_eq!(station.recv_text().await.unwrap(), r#"[3,"v1",{"status":"Rejected"}]"#);

    // Other vendors pass: the voter abstains and the default applies
    station.inject_text(r#"[2,"v2","DataTransfer",{"vendorId":"acme"}]"#);
    let forwarded = parse(&csms.recv_text().await.unwrap());
    assert_eq!(forwarded[3], "v2");
}

#[tokio::test]
async fn test_highest_priority_vote_wins() {
    let network = MemoryNetwork::new();
    let controller = relay(&network, relay_config());
    controller.register_voter(Arc::new(FnVoter::new("low", 1, |_ctx| Some(Vote::forward("low says forward")))));
    let high = controller.register_voter(Arc::new(FnVoter::new("high", 5, |_ctx| {
        Some(Vote::reject_with(
            RejectResponse::Error(HandlerError::new(ErrorCode::SecurityError, "Not allowed here")),
            "high says no",
        ))
    })));
    controller.register_voter(Arc::new(FnVoter::new("abstainer", 9, |_ctx| None)));

    let mut station = network.attach_peer(&controller, "CS001", ConnectionRole::Downstream, FrameProfile::Standard);
    let mut csms = network.attach_peer(&controller, "CSMS-1", ConnectionRole::Upstream, FrameProfile::Routed);

    station.inject_text(r#"[2,"p1","Heartbeat",{}]"#);
    assert_eq!(
        station.recv_text().await.unwrap(),
        r#"[4,"p1","SecurityError","Not allowed here",{}]"#
    );

    assert!(controller.deregister_voter(high));
    station.inject_text(r#"[2,"p2","Heartbeat",{}]"#);
    let forwarded = parse(&csms.recv_text().await.unwrap());
    assert_eq!(forwarded[3], "p2");
}

#[tokio::test]
async fn test_panicking_voter_counts_as_abstain() {
    let network = MemoryNetwork::new();
    let controller = relay(
        &network,
        relay_config().with_default_forwarding(ForwardingOutcome::Reject),
    );
    controller.register_voter(Arc::new(FnVoter::new("broken", 10, |_ctx| -> Option<Vote> {
        panic!("voter bug")
    })));
    let mut station = network.attach_peer(&controller, "CS001", ConnectionRole::Downstream, FrameProfile::Standard);
    let _csms = network.attach_peer(&controller, "CSMS-1", ConnectionRole::Upstream, FrameProfile::Routed);

    station.inject_text(r#"[2,"x1","Heartbeat",{}]"#);

    let reply = parse(&station.recv_text().await.unwrap());
    assert_eq!(reply[2], "GenericError");
    assert_eq!(reply[4]["filtered"], true);
}

#[tokio::test]
async fn test_unknown_action_not_forwarded() {
    let network = MemoryNetwork::new();
    let controller = relay(&network, relay_config());
    let mut station = network.attach_peer(&controller, "CS001", ConnectionRole::Downstream, FrameProfile::Standard);
    let mut csms = network.attach_peer(&controller, "CSMS-1", ConnectionRole::Upstream, FrameProfile::Routed);

    station.inject_text(r#"[2,"u1","VendorSpecificThing",{}]"#);

    assert_eq!(
        station.recv_text().await.unwrap(),
        r#"[4,"u1","NotImplemented","Requested Action is not known by receiver",{}]"#
    );
    assert!(csms.try_recv().is_none());
}

#[tokio::test]
async fn test_unknown_action_forwarded_when_enabled() {
    let network = MemoryNetwork::new();
    let controller = relay(&network, relay_config().with_forward_unknown_actions(true));
    let station = network.attach_peer(&controller, "CS001", ConnectionRole::Downstream, FrameProfile::Standard);
    let mut csms = network.attach_peer(&controller, "CSMS-1", ConnectionRole::Upstream, FrameProfile::Routed);

    station.inject_text(r#"[2,"u2","VendorSpecificThing",{"x":1}]"#);

    assert_eq!(
        csms.recv_text().await.unwrap(),
        r#"[2,"CSMS",["CS001","LC1"],"u2","VendorSpecificThing",{"x":1}]"#
    );
}

#[tokio::test]
async fn test_unparseable_payload_rejected() {
    let network = MemoryNetwork::new();
    let controller = relay(&network, relay_config());
    let mut station = network.attach_peer(&controller, "CS001", ConnectionRole::Downstream, FrameProfile::Standard);
    let _csms = network.attach_peer(&controller, "CSMS-1", ConnectionRole::Upstream, FrameProfile::Routed);

    station.inject_text(r#"[2,"b1","DataTransfer",{"vendorId":42}]"#);

    let reply = parse(&station.recv_text().await.unwrap());
    assert_eq!(reply[2], "FormationViolation");
}

#[tokio::test]
async fn test_loop_rejected() {
    let network = MemoryNetwork::new();
    let controller = relay(&network, relay_config());
    let _station = network.attach_peer(&controller, "CS001", ConnectionRole::Downstream, FrameProfile::Standard);
    let mut csms = network.attach_peer(&controller, "CSMS-1", ConnectionRole::Upstream, FrameProfile::Routed);

    csms.inject_text(r#"[2,"CS001",["CSMS-1","LC1"],"l1","Reset",{"type":"Immediate"}]"#);

    let reply = parse(&csms.recv_text().await.unwrap());
    assert_eq!(reply[0], 4);
    assert_eq!(reply[3], "l1");
    assert_eq!(reply[4], "FormationViolation");
    assert_eq!(reply[5], "Loop detected: LC1 is already in the network path");
}

#[tokio::test]
async fn test_no_route_rejected() {
    let network = MemoryNetwork::new();
    let controller = relay(&network, relay_config());
    let mut station = network.attach_peer(&controller, "CS001", ConnectionRole::Downstream, FrameProfile::Standard);

    station.inject_text(r#"[2,"n1","Heartbeat",{}]"#);

    assert_eq!(
        station.recv_text().await.unwrap(),
        r#"[4,"n1","GenericError","No route to CSMS",{}]"#
    );
}

#[tokio::test]
async fn test_reply_crosses_plain_link_back_upstream() {
    let network = MemoryNetwork::new();
    let controller = relay(&network, relay_config());
    let mut station = network.attach_peer(&controller, "CS001", ConnectionRole::Downstream, FrameProfile::Standard);
    let mut csms = network.attach_peer(&controller, "CSMS-1", ConnectionRole::Upstream, FrameProfile::Routed);

    csms.inject_text(r#"[2,"CS001",["CSMS-1"],"r1","Reset",{"type":"Immediate"}]"#);

    assert_eq!(
        station.recv_text().await.unwrap(),
        r#"[2,"r1","Reset",{"type":"Immediate"}]"#
    );

    station.inject_text(r#"[3,"r1",{"status":"Accepted"}]"#);

    let reply = parse(&csms.recv_text().await.unwrap());
    assert_eq!(reply, json!([3, "CSMS-1", ["CSMS-1"], "r1", {"status": "Accepted"}]));
}

#[tokio::test]
async fn test_csms_reaches_station_behind_controller() {
    let network = MemoryNetwork::new();
    let csms = NetworkingNode::builder(NodeConfig::csms("CSMS-1").with_static_route("CS001", "LC1"))
        .build(network.clone())
        .unwrap();
    let controller = relay(&network, relay_config());
    let station = NetworkingNode::builder(NodeConfig::new("CS001"))
        .handler("Reset", |_ctx, _payload| async {
            Payload::json(&json!({"status": "Accepted"})).map_err(HandlerError::from)
        })
        .build(network.clone())
        .unwrap();
    network.link(&station, &controller, FrameProfile::Standard);
    network.link(&controller, &csms, FrameProfile::Routed);

    let response = tokio::time::timeout(
        Duration::from_secs(5),
        csms.send(
            SendRequest::new("Reset", Payload::json(&json!({"type": "Immediate"})).unwrap()).to("CS001"),
        ),
    )
    .await
    .unwrap();

    assert!(response.is_ok(), "{:?}", response.result);
    let body: Value = response.parse_payload().unwrap();
    assert_eq!(body["status"], "Accepted");
}

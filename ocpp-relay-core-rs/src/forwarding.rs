//! Forwarding decision pipeline
//!
//! Decides what a relay does with a request addressed to some other node:
//!
//! 1. Parse the payload with the action's registered parser. Unknown actions
//!    and parse failures are rejected right away.
//! 2. Ask every registered voter concurrently, each bounded by the vote timeout.
//! 3. Adopt the first non-abstaining vote in voter order (priority, highest
//!    first, then registration order). No vote at all means the configured
//!    default policy.
//! 4. A rejection without an explicit response gets a synthesized
//!    `GenericError` carrying the `filtered` marker, pre-encoded for the
//!    connection the request came from.
//! 5. Log and report the decision.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use futures_util::FutureExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{self, Frame, FrameProfile};
use crate::config::NodeConfig;
use crate::handler::HandlerError;
use crate::messages::{CallError, CallResult, Envelope, ErrorCode, Message, Payload};
use crate::registry::{ActionRegistry, ParsedRequest};
use crate::result::FILTERED_MARKER;
use crate::telemetry::{panic_message, Telemetry, TelemetryEvent};
use crate::types::{ConnectionId, NodeId, RequestId};

/// What happens to a transiting request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardingOutcome {
    /// Relay to the destination
    Forward,
    /// Answer on the destination's behalf; the destination never sees it
    Reject,
    /// Discard silently
    Drop,
}

impl fmt::Display for ForwardingOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ForwardingOutcome::Forward => "forward",
            ForwardingOutcome::Reject => "reject",
            ForwardingOutcome::Drop => "drop",
        })
    }
}

impl FromStr for ForwardingOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "forward" => Ok(ForwardingOutcome::Forward),
            "reject" => Ok(ForwardingOutcome::Reject),
            "drop" => Ok(ForwardingOutcome::Drop),
            other => Err(format!("unknown forwarding policy: {}", other)),
        }
    }
}

/// Concrete answer a voter supplies with a rejection
#[derive(Debug, Clone, PartialEq)]
pub enum RejectResponse {
    Result(Payload),
    Error(HandlerError),
}

/// A voter's opinion on one request
#[derive(Debug, Clone, PartialEq)]
pub struct Vote {
    pub outcome: ForwardingOutcome,
    pub response: Option<RejectResponse>,
    pub log_message: String,
}

impl Vote {
    pub fn forward(log_message: impl Into<String>) -> Self {
        Self {
            outcome: ForwardingOutcome::Forward,
            response: None,
            log_message: log_message.into(),
        }
    }

    pub fn reject(log_message: impl Into<String>) -> Self {
        Self {
            outcome: ForwardingOutcome::Reject,
            response: None,
            log_message: log_message.into(),
        }
    }

    pub fn reject_with(response: RejectResponse, log_message: impl Into<String>) -> Self {
        Self {
            outcome: ForwardingOutcome::Reject,
            response: Some(response),
            log_message: log_message.into(),
        }
    }

    pub fn drop(log_message: impl Into<String>) -> Self {
        Self {
            outcome: ForwardingOutcome::Drop,
            response: None,
            log_message: log_message.into(),
        }
    }
}

/// What a voter gets to look at
#[derive(Clone)]
pub struct VoteContext {
    pub timestamp: DateTime<Utc>,
    /// Peer the request arrived from
    pub sender: NodeId,
    pub connection: ConnectionId,
    pub request: Arc<Envelope>,
    /// Typed request; `None` for actions the registry does not know
    pub parsed: Option<ParsedRequest>,
    /// Fires when the round is over or the node shuts down
    pub cancel: CancellationToken,
}

impl VoteContext {
    pub fn action(&self) -> &str {
        match &self.request.message {
            Message::Call(call) => &call.action,
            _ => "",
        }
    }

    /// Typed view of the parsed request
    pub fn parsed_as<T: Any>(&self) -> Option<&T> {
        self.parsed.as_ref()?.downcast_ref::<T>()
    }
}

/// A forwarding policy
#[async_trait]
pub trait ForwardingVoter: Send + Sync {
    fn name(&self) -> &str;

    /// Higher priorities are consulted first
    fn priority(&self) -> i32 {
        0
    }

    /// `None` abstains
    async fn vote(&self, ctx: &VoteContext) -> Option<Vote>;
}

/// Voter backed by a synchronous closure
pub struct FnVoter<F> {
    name: String,
    priority: i32,
    f: F,
}

impl<F> FnVoter<F>
where
    F: Fn(&VoteContext) -> Option<Vote> + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, priority: i32, f: F) -> Self {
        Self {
            name: name.into(),
            priority,
            f,
        }
    }
}

#[async_trait]
impl<F> ForwardingVoter for FnVoter<F>
where
    F: Fn(&VoteContext) -> Option<Vote> + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn vote(&self, ctx: &VoteContext) -> Option<Vote> {
        (self.f)(ctx)
    }
}

/// A request that is not addressed to this node
#[derive(Debug, Clone)]
pub struct TransitRequest {
    pub envelope: Arc<Envelope>,
    pub sender: NodeId,
    pub connection: ConnectionId,
    /// Framing of the connection the request arrived on
    pub profile: FrameProfile,
}

/// Final decision for one transiting request
#[derive(Debug, Clone)]
pub struct ForwardingDecision {
    pub request: Arc<Envelope>,
    pub outcome: ForwardingOutcome,
    /// Reply sent back instead of forwarding
    pub reject_response: Option<Envelope>,
    /// `reject_response` encoded for the arrival connection
    pub serialized_reject: Option<Frame>,
    pub log_message: String,
    /// Voter whose vote was adopted; `None` for built-in decisions
    pub decided_by: Option<String>,
}

/// Registration handle, used to remove a voter again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VoterHandle(u64);

struct RegisteredVoter {
    handle: VoterHandle,
    priority: i32,
    voter: Arc<dyn ForwardingVoter>,
}

pub struct ForwardingPipeline {
    local: NodeId,
    default_outcome: ForwardingOutcome,
    vote_timeout: Duration,
    forward_unknown_actions: bool,
    registry: Arc<ActionRegistry>,
    telemetry: Telemetry,
    voters: RwLock<Vec<RegisteredVoter>>,
    next_handle: AtomicU64,
    shutdown: CancellationToken,
}

impl ForwardingPipeline {
    pub fn new(config: &NodeConfig, registry: Arc<ActionRegistry>, telemetry: Telemetry) -> Self {
        Self {
            local: config.node_id.clone(),
            default_outcome: config.default_forwarding,
            vote_timeout: config.vote_timeout,
            forward_unknown_actions: config.forward_unknown_actions,
            registry,
            telemetry,
            voters: RwLock::new(Vec::new()),
            next_handle: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        }
    }

    /// Add a voter. Rounds already running keep their own voter snapshot.
    pub fn register(&self, voter: Arc<dyn ForwardingVoter>) -> VoterHandle {
        let handle = VoterHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let priority = voter.priority();
        info!("Registered forwarding voter {} (priority {})", voter.name(), priority);

        let mut voters = self.voters.write();
        let position = voters
            .iter()
            .position(|r| r.priority < priority)
            .unwrap_or(voters.len());
        voters.insert(
            position,
            RegisteredVoter {
                handle,
                priority,
                voter,
            },
        );
        handle
    }

    pub fn deregister(&self, handle: VoterHandle) -> bool {
        let mut voters = self.voters.write();
        let before = voters.len();
        voters.retain(|r| r.handle != handle);
        voters.len() != before
    }

    pub fn voter_count(&self) -> usize {
        self.voters.read().len()
    }

    /// Cancel every running vote
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Compute the decision for a transiting request
    pub async fn decide(&self, transit: &TransitRequest) -> ForwardingDecision {
        let decision = self.evaluate(transit).await;
        self.announce(&decision);
        decision
    }

    async fn evaluate(&self, transit: &TransitRequest) -> ForwardingDecision {
        let call = match &transit.envelope.message {
            Message::Call(call) => call,
            _ => {
                return self.plain(transit, ForwardingOutcome::Drop, "not a request", None);
            }
        };

        let parsed = if self.registry.contains(&call.action) {
            match self.registry.parse_request(&call.action, &call.payload) {
                Ok(parsed) => Some(parsed),
                Err(e) => {
                    return self.rejection(
                        transit,
                        Some(RejectResponse::Error(HandlerError::new(
                            ErrorCode::FormationViolation,
                            e.to_string(),
                        ))),
                        format!("payload does not parse: {}", e),
                        None,
                    );
                }
            }
        } else if self.forward_unknown_actions {
            None
        } else {
            return self.rejection(
                transit,
                Some(RejectResponse::Error(HandlerError::new(
                    ErrorCode::NotImplemented,
                    "Requested Action is not known by receiver",
                ))),
                format!("unknown action {}", call.action),
                None,
            );
        };

        let voters: Vec<Arc<dyn ForwardingVoter>> =
            self.voters.read().iter().map(|r| r.voter.clone()).collect();

        if voters.is_empty() {
            return self.by_default(transit, "no voters registered");
        }

        let ctx = VoteContext {
            timestamp: Utc::now(),
            sender: transit.sender.clone(),
            connection: transit.connection.clone(),
            request: transit.envelope.clone(),
            parsed,
            cancel: self.shutdown.child_token(),
        };

        let ballots = join_all(voters.iter().map(|voter| self.ballot(voter.as_ref(), &ctx))).await;
        ctx.cancel.cancel();

        let adopted = voters
            .iter()
            .zip(ballots)
            .find_map(|(voter, vote)| vote.map(|v| (voter.name().to_string(), v)));

        match adopted {
            Some((name, vote)) => match vote.outcome {
                ForwardingOutcome::Reject => self.rejection(transit, vote.response, vote.log_message, Some(name)),
                outcome => self.plain(transit, outcome, vote.log_message, Some(name)),
            },
            None => self.by_default(transit, "all voters abstained"),
        }
    }

    /// One voter's vote, bounded by the vote timeout. Faults count as abstaining.
    async fn ballot(&self, voter: &dyn ForwardingVoter, ctx: &VoteContext) -> Option<Vote> {
        let name = voter.name();
        let vote = tokio::time::timeout(self.vote_timeout, AssertUnwindSafe(voter.vote(ctx)).catch_unwind());

        tokio::select! {
            result = vote => match result {
                Ok(Ok(vote)) => vote,
                Ok(Err(panic)) => {
                    self.telemetry.callback_fault(
                        format!("voter {}", name),
                        format!("panicked: {}", panic_message(panic.as_ref())),
                    );
                    None
                }
                Err(_) => {
                    warn!("Voter {} did not vote within {:?}", name, self.vote_timeout);
                    None
                }
            },
            _ = ctx.cancel.cancelled() => {
                debug!("Vote of {} cancelled", name);
                None
            }
        }
    }

    fn by_default(&self, transit: &TransitRequest, reason: &str) -> ForwardingDecision {
        let log_message = format!("{}, default policy {}", reason, self.default_outcome);
        match self.default_outcome {
            ForwardingOutcome::Reject => self.rejection(transit, None, log_message, None),
            outcome => self.plain(transit, outcome, log_message, None),
        }
    }

    fn plain(
        &self,
        transit: &TransitRequest,
        outcome: ForwardingOutcome,
        log_message: impl Into<String>,
        decided_by: Option<String>,
    ) -> ForwardingDecision {
        ForwardingDecision {
            request: transit.envelope.clone(),
            outcome,
            reject_response: None,
            serialized_reject: None,
            log_message: log_message.into(),
            decided_by,
        }
    }

    /// Build a rejection travelling back along the request's path
    pub fn rejection(
        &self,
        transit: &TransitRequest,
        response: Option<RejectResponse>,
        log_message: impl Into<String>,
        decided_by: Option<String>,
    ) -> ForwardingDecision {
        let request_id = transit.envelope.request_id().clone();
        let message = match response {
            Some(RejectResponse::Result(payload)) => Message::CallResult(CallResult::new(request_id, payload)),
            Some(RejectResponse::Error(error)) => Message::CallError(error.into_call_error(request_id)),
            None => Message::CallError(self.filtered_error(request_id)),
        };

        let reply = transit.envelope.reply(message);
        let serialized_reject = match codec::encode(&reply, transit.profile) {
            Ok(frame) => Some(frame),
            Err(e) => {
                warn!("Failed to encode rejection for {}: {}", reply.request_id(), e);
                None
            }
        };

        ForwardingDecision {
            request: transit.envelope.clone(),
            outcome: ForwardingOutcome::Reject,
            reject_response: Some(reply),
            serialized_reject,
            log_message: log_message.into(),
            decided_by,
        }
    }

    fn filtered_error(&self, request_id: RequestId) -> CallError {
        let mut details = Map::new();
        details.insert(FILTERED_MARKER.to_string(), Value::Bool(true));
        details.insert("node".to_string(), Value::String(self.local.to_string()));

        CallError::new(
            request_id,
            ErrorCode::GenericError,
            "Request filtered by networking node policy",
        )
        .with_details(Value::Object(details))
    }

    fn announce(&self, decision: &ForwardingDecision) {
        let request_id = decision.request.request_id().clone();
        let action = match &decision.request.message {
            Message::Call(call) => call.action.clone(),
            _ => String::new(),
        };
        let by = decision.decided_by.as_deref().unwrap_or("default");

        match decision.outcome {
            ForwardingOutcome::Forward => {
                debug!("Forward {} ({}) [{}]: {}", action, request_id, by, decision.log_message);
            }
            ForwardingOutcome::Reject => {
                info!("Reject {} ({}) [{}]: {}", action, request_id, by, decision.log_message);
                self.telemetry.emit(TelemetryEvent::Rejected {
                    request_id,
                    action,
                    reason: decision.log_message.clone(),
                });
            }
            ForwardingOutcome::Drop => {
                info!("Drop {} ({}) [{}]: {}", action, request_id, by, decision.log_message);
                self.telemetry.emit(TelemetryEvent::Dropped {
                    request_id,
                    action,
                    reason: decision.log_message.clone(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addressing::NetworkPath;
    use crate::messages::Call;
    use crate::result::{ExchangeResult, ResultCode};
    use bytes::Bytes;

    #[derive(Debug, Serialize, Deserialize)]
    struct BootNotification {
        reason: String,
    }

    fn registry() -> Arc<ActionRegistry> {
        let mut registry = ActionRegistry::new();
        registry
            .register_json::<Value, Value>("Heartbeat")
            .register_json::<BootNotification, Value>("BootNotification")
            .register_binary::<Bytes, Value>("BinaryDataTransfer");
        Arc::new(registry)
    }

    fn pipeline(config: NodeConfig) -> ForwardingPipeline {
        ForwardingPipeline::new(&config, registry(), Telemetry::default())
    }

    fn transit(action: &str, payload: Payload) -> TransitRequest {
        let envelope = Envelope::call(Call::with_id(RequestId::from("t-1"), action, payload))
            .to(NodeId::from("CS042"))
            .via(NetworkPath::single(NodeId::from("CSMS-1")));
        TransitRequest {
            envelope: Arc::new(envelope),
            sender: NodeId::from("CSMS-1"),
            connection: ConnectionId::from("up"),
            profile: FrameProfile::Routed,
        }
    }

    fn heartbeat() -> TransitRequest {
        transit("Heartbeat", Payload::empty())
    }

    fn decoded_result(decision: &ForwardingDecision) -> ExchangeResult {
        let frame = decision.serialized_reject.as_ref().unwrap();
        match codec::decode(frame).unwrap().message {
            Message::CallError(error) => ExchangeResult::from_call_error(&error),
            other => panic!("Expected CallError, got {:?}", other),
        }
    }

    struct SlowVoter;

    #[async_trait]
    impl ForwardingVoter for SlowVoter {
        fn name(&self) -> &str {
            "slow"
        }

        fn priority(&self) -> i32 {
            100
        }

        async fn vote(&self, _ctx: &VoteContext) -> Option<Vote> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Some(Vote::drop("too late"))
        }
    }

    struct PanickingVoter;

    #[async_trait]
    impl ForwardingVoter for PanickingVoter {
        fn name(&self) -> &str {
            "panicking"
        }

        fn priority(&self) -> i32 {
            10
        }

        async fn vote(&self, _ctx: &VoteContext) -> Option<Vote> {
            panic!("voter bug")
        }
    }

    /// Votes reject once released; signals when its vote has started
    struct GatedVoter {
        entered: Arc<tokio::sync::Notify>,
        release: Arc<tokio::sync::Notify>,
    }

    #[async_trait]
    impl ForwardingVoter for GatedVoter {
        fn name(&self) -> &str {
            "gated"
        }

        async fn vote(&self, _ctx: &VoteContext) -> Option<Vote> {
            self.entered.notify_one();
            self.release.notified().await;
            Some(Vote::reject("gated"))
        }
    }

    #[tokio::test]
    async fn test_default_forward_without_voters() {
        let decision = pipeline(NodeConfig::new("NN1")).decide(&heartbeat()).await;
        assert_eq!(decision.outcome, ForwardingOutcome::Forward);
        assert!(decision.reject_response.is_none());
        assert!(decision.decided_by.is_none());
    }

    #[tokio::test]
    async fn test_default_reject_synthesizes_filtered() {
        let pipeline = pipeline(NodeConfig::new("NN1").with_default_forwarding(ForwardingOutcome::Reject));
        let decision = pipeline.decide(&heartbeat()).await;

        assert_eq!(decision.outcome, ForwardingOutcome::Reject);
        let reply = decision.reject_response.as_ref().unwrap();
        assert_eq!(reply.destination, Some(NodeId::from("CSMS-1")));
        assert_eq!(reply.network_path, NetworkPath::single(NodeId::from("CSMS-1")));

        let result = decoded_result(&decision);
        assert_eq!(result.code, ResultCode::Filtered);
        assert_eq!(result.details.unwrap()["node"], "NN1");
    }

    #[tokio::test]
    async fn test_priority_then_registration_order() {
        let pipeline = pipeline(NodeConfig::new("NN1"));
        pipeline.register(Arc::new(FnVoter::new("low", 0, |_| Some(Vote::forward("low")))));
        pipeline.register(Arc::new(FnVoter::new("first", 5, |_| Some(Vote::reject("first")))));
        pipeline.register(Arc::new(FnVoter::new("second", 5, |_| Some(Vote::drop("second")))));

        let decision = pipeline.decide(&heartbeat()).await;
        assert_eq!(decision.outcome, ForwardingOutcome::Reject);
        assert_eq!(decision.decided_by.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn test_abstaining_voters_fall_back_to_default() {
        let pipeline = pipeline(NodeConfig::new("NN1").with_default_forwarding(ForwardingOutcome::Drop));
        pipeline.register(Arc::new(FnVoter::new("quiet", 0, |_| None)));

        let decision = pipeline.decide(&heartbeat()).await;
        assert_eq!(decision.outcome, ForwardingOutcome::Drop);
    }

    #[tokio::test]
    async fn test_slow_and_panicking_voters_are_ignored() {
        let pipeline = pipeline(NodeConfig::new("NN1").with_vote_timeout(Duration::from_millis(50)));
        pipeline.register(Arc::new(SlowVoter));
        pipeline.register(Arc::new(PanickingVoter));
        pipeline.register(Arc::new(FnVoter::new("sane", 0, |_| Some(Vote::reject("sane")))));

        let decision = pipeline.decide(&heartbeat()).await;
        assert_eq!(decision.decided_by.as_deref(), Some("sane"));
        assert_eq!(decision.outcome, ForwardingOutcome::Reject);
    }

    #[tokio::test]
    async fn test_voter_sees_parsed_request() {
        let pipeline = pipeline(NodeConfig::new("NN1"));
        pipeline.register(Arc::new(FnVoter::new("boot-filter", 0, |ctx| {
            let boot = ctx.parsed_as::<BootNotification>()?;
            (boot.reason == "Watchdog").then(|| Vote::reject("watchdog reboots stay local"))
        })));

        let watchdog = transit("BootNotification", Payload::raw_json(r#"{"reason":"Watchdog"}"#).unwrap());
        assert_eq!(pipeline.decide(&watchdog).await.outcome, ForwardingOutcome::Reject);

        let power_up = transit("BootNotification", Payload::raw_json(r#"{"reason":"PowerUp"}"#).unwrap());
        assert_eq!(pipeline.decide(&power_up).await.outcome, ForwardingOutcome::Forward);
    }

    #[tokio::test]
    async fn test_parse_failure_rejects_before_voting() {
        let pipeline = pipeline(NodeConfig::new("NN1"));
        pipeline.register(Arc::new(FnVoter::new("yes", 0, |_| Some(Vote::forward("yes")))));

        let broken = transit("BootNotification", Payload::raw_json(r#"{"cause":"PowerUp"}"#).unwrap());
        let decision = pipeline.decide(&broken).await;

        assert_eq!(decision.outcome, ForwardingOutcome::Reject);
        assert!(decision.decided_by.is_none());
        assert_eq!(decoded_result(&decision).code, ResultCode::FormationViolation);
    }

    #[tokio::test]
    async fn test_unknown_action_policy() {
        let unknown = transit("VendorSpecific", Payload::empty());

        let strict = pipeline(NodeConfig::new("NN1")).decide(&unknown).await;
        assert_eq!(strict.outcome, ForwardingOutcome::Reject);
        assert_eq!(decoded_result(&strict).code, ResultCode::NotImplemented);

        let lenient = pipeline(NodeConfig::new("NN1").with_forward_unknown_actions(true))
            .decide(&unknown)
            .await;
        assert_eq!(lenient.outcome, ForwardingOutcome::Forward);
    }

    #[tokio::test]
    async fn test_binary_request_rejected_on_binary_channel() {
        let pipeline = pipeline(NodeConfig::new("NN1").with_default_forwarding(ForwardingOutcome::Reject));
        let request = transit("BinaryDataTransfer", Payload::binary(vec![1u8, 2, 3]));

        let decision = pipeline.decide(&request).await;
        assert!(matches!(decision.serialized_reject, Some(Frame::Binary(_))));
        assert_eq!(decoded_result(&decision).code, ResultCode::Filtered);
    }

    #[tokio::test]
    async fn test_explicit_reject_response() {
        let pipeline = pipeline(NodeConfig::new("NN1"));
        pipeline.register(Arc::new(FnVoter::new("cache", 0, |_| {
            Some(Vote::reject_with(
                RejectResponse::Result(Payload::raw_json(r#"{"currentTime":"2024-01-01T00:00:00Z"}"#).ok()?),
                "answered from cache",
            ))
        })));

        let decision = pipeline.decide(&heartbeat()).await;
        let frame = decision.serialized_reject.unwrap();
        assert_eq!(
            frame,
            Frame::Text(r#"[3,"CSMS-1",["CSMS-1"],"t-1",{"currentTime":"2024-01-01T00:00:00Z"}]"#.to_string())
        );
    }

    #[tokio::test]
    async fn test_deregister() {
        let pipeline = pipeline(NodeConfig::new("NN1"));
        let handle = pipeline.register(Arc::new(FnVoter::new("deny", 0, |_| Some(Vote::reject("deny")))));
        assert_eq!(pipeline.voter_count(), 1);

        assert!(pipeline.deregister(handle));
        assert!(!pipeline.deregister(handle));
        assert_eq!(pipeline.decide(&heartbeat()).await.outcome, ForwardingOutcome::Forward);
    }

    #[tokio::test]
    async fn test_registration_changes_during_round() {
        let pipeline = Arc::new(pipeline(NodeConfig::new("NN1")));
        let entered = Arc::new(tokio::sync::Notify::new());
        let release = Arc::new(tokio::sync::Notify::new());
        pipeline.register(Arc::new(GatedVoter {
            entered: entered.clone(),
            release: release.clone(),
        }));
        let doomed = pipeline.register(Arc::new(FnVoter::new("doomed", 10, |_| Some(Vote::drop("doomed")))));

        let running = pipeline.clone();
        let round = tokio::spawn(async move { running.decide(&heartbeat()).await });
        entered.notified().await;

        pipeline.register(Arc::new(FnVoter::new("late", 20, |_| Some(Vote::forward("late")))));
        assert!(pipeline.deregister(doomed));
        assert_eq!(pipeline.voter_count(), 2);
        release.notify_one();

        // The round keeps the voters it started with
        let decision = round.await.unwrap();
        assert_eq!(decision.decided_by.as_deref(), Some("doomed"));
        assert_eq!(decision.outcome, ForwardingOutcome::Drop);

        release.notify_one();
        let decision = pipeline.decide(&heartbeat()).await;
        assert_eq!(decision.decided_by.as_deref(), Some("late"));
        assert_eq!(decision.outcome, ForwardingOutcome::Forward);
    }

    #[test]
    fn test_outcome_from_str() {
        assert_eq!("Reject".parse::<ForwardingOutcome>(), Ok(ForwardingOutcome::Reject));
        assert!("maybe".parse::<ForwardingOutcome>().is_err());
    }
}

//! Standard OCPP action set
//!
//! Typed payloads for the actions a networking node deals with most, the
//! registry entries for them, and default CSMS-side answers.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use ocpp_relay_core::{ActionRegistry, BinaryPayload, CodecError, NodeBuilder};

pub const BOOT_NOTIFICATION: &str = "BootNotification";
pub const HEARTBEAT: &str = "Heartbeat";
pub const STATUS_NOTIFICATION: &str = "StatusNotification";
pub const DATA_TRANSFER: &str = "DataTransfer";
pub const BINARY_DATA_TRANSFER: &str = "BinaryDataTransfer";
pub const SET_CHARGING_PROFILE: &str = "SetChargingProfile";

// ============================================================================
// Enumerations
// ============================================================================

/// Charging station status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectorStatus {
    Available,
    Occupied,
    Reserved,
    Unavailable,
    Faulted,
}

/// Boot reason
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BootReason {
    ApplicationReset,
    FirmwareUpdate,
    LocalReset,
    PowerUp,
    RemoteReset,
    ScheduledReset,
    Triggered,
    Unknown,
    Watchdog,
}

/// Registration status for BootNotification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum RegistrationStatus {
    Accepted,
    Pending,
    Rejected,
}

/// Generic OCPP status for responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum GenericStatus {
    Accepted,
    Rejected,
}

/// DataTransfer outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataTransferStatus {
    Accepted,
    Rejected,
    UnknownMessageId,
    UnknownVendorId,
}

/// Charging profile purpose
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargingProfilePurpose {
    ChargingStationMaxProfile,
    TxDefaultProfile,
    TxProfile,
}

/// Charging profile kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargingProfileKind {
    Absolute,
    Recurring,
    Relative,
}

/// Charging rate unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargingRateUnit {
    W,
    A,
}

// ============================================================================
// Complex Types
// ============================================================================

/// Charging station information
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargingStationInfo {
    pub model: String,
    pub vendor_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
}

/// Status info for responses
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusInfo {
    pub reason_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_info: Option<String>,
}

/// Charging schedule period
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargingSchedulePeriod {
    pub start_period: i32,
    pub limit: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub number_phases: Option<i32>,
}

/// Charging schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargingSchedule {
    pub id: i32,
    pub charging_rate_unit: ChargingRateUnit,
    pub charging_schedule_period: Vec<ChargingSchedulePeriod>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_schedule: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<i32>,
}

/// Charging profile
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargingProfile {
    pub id: i32,
    pub stack_level: i32,
    pub charging_profile_purpose: ChargingProfilePurpose,
    pub charging_profile_kind: ChargingProfileKind,
    pub charging_schedule: Vec<ChargingSchedule>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
}

// ============================================================================
// Request / Response Messages
// ============================================================================

/// BootNotification request (CS -> CSMS)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootNotificationRequest {
    pub charging_station: ChargingStationInfo,
    pub reason: BootReason,
}

/// BootNotification response (CSMS -> CS)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootNotificationResponse {
    pub current_time: DateTime<Utc>,
    pub interval: i32,
    pub status: RegistrationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_info: Option<StatusInfo>,
}

/// Heartbeat request (CS -> CSMS)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatRequest {}

/// Heartbeat response (CSMS -> CS)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub current_time: DateTime<Utc>,
}

/// StatusNotification request (CS -> CSMS)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusNotificationRequest {
    pub timestamp: DateTime<Utc>,
    pub connector_status: ConnectorStatus,
    pub evse_id: i32,
    pub connector_id: i32,
}

/// StatusNotification response (CSMS -> CS)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusNotificationResponse {}

/// DataTransfer request (either direction)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataTransferRequest {
    pub vendor_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// DataTransfer response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataTransferResponse {
    pub status: DataTransferStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// BinaryDataTransfer request: opaque bytes on the binary channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryDataTransferRequest {
    pub data: Bytes,
}

impl BinaryPayload for BinaryDataTransferRequest {
    fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(Self {
            data: Bytes::copy_from_slice(bytes),
        })
    }

    fn to_bytes(&self) -> Bytes {
        self.data.clone()
    }
}

/// BinaryDataTransfer response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BinaryDataTransferResponse {
    pub status: DataTransferStatus,
}

/// SetChargingProfile request (CSMS -> CS)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetChargingProfileRequest {
    pub evse_id: i32,
    pub charging_profile: ChargingProfile,
}

/// SetChargingProfile response (CS -> CSMS)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetChargingProfileResponse {
    pub status: GenericStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_info: Option<StatusInfo>,
}

/// Add the standard actions to `registry`
pub fn register_standard_actions(registry: &mut ActionRegistry) -> &mut ActionRegistry {
    registry
        .register_json::<BootNotificationRequest, BootNotificationResponse>(BOOT_NOTIFICATION)
        .register_json::<HeartbeatRequest, HeartbeatResponse>(HEARTBEAT)
        .register_json::<StatusNotificationRequest, StatusNotificationResponse>(STATUS_NOTIFICATION)
        .register_json::<DataTransferRequest, DataTransferResponse>(DATA_TRANSFER)
        .register_binary::<BinaryDataTransferRequest, BinaryDataTransferResponse>(BINARY_DATA_TRANSFER)
        .register_json::<SetChargingProfileRequest, SetChargingProfileResponse>(SET_CHARGING_PROFILE)
}

/// Registry holding just the standard actions
pub fn standard_registry() -> ActionRegistry {
    let mut registry = ActionRegistry::new();
    register_standard_actions(&mut registry);
    registry
}

/// Answers given by [`csms_handlers`]
#[derive(Debug, Clone)]
pub struct CsmsDefaults {
    /// Heartbeat interval handed out on boot, in seconds
    pub heartbeat_interval: i32,
    /// Vendors whose DataTransfer is accepted; empty accepts every vendor
    pub accepted_vendors: Vec<String>,
}

impl Default for CsmsDefaults {
    fn default() -> Self {
        Self {
            heartbeat_interval: 300,
            accepted_vendors: Vec::new(),
        }
    }
}

impl CsmsDefaults {
    fn accepts_vendor(&self, vendor_id: &str) -> bool {
        self.accepted_vendors.is_empty() || self.accepted_vendors.iter().any(|v| v == vendor_id)
    }
}

/// Register the standard actions and install default CSMS answers for the
/// station-initiated ones
pub fn csms_handlers(mut builder: NodeBuilder, defaults: CsmsDefaults) -> NodeBuilder {
    register_standard_actions(builder.registry_mut());
    let defaults = Arc::new(defaults);
    let interval = defaults.heartbeat_interval;

    builder
        .typed_handler::<BootNotificationRequest, BootNotificationResponse, _, _>(
            BOOT_NOTIFICATION,
            move |ctx, request| async move {
                info!(
                    "BootNotification from {} ({} {}, {:?})",
                    ctx.origin(),
                    request.charging_station.vendor_name,
                    request.charging_station.model,
                    request.reason
                );
                Ok(BootNotificationResponse {
                    current_time: Utc::now(),
                    interval,
                    status: RegistrationStatus::Accepted,
                    status_info: None,
                })
            },
        )
        .typed_handler::<HeartbeatRequest, HeartbeatResponse, _, _>(HEARTBEAT, |ctx, _request| async move {
            debug!("Heartbeat from {}", ctx.origin());
            Ok(HeartbeatResponse {
                current_time: Utc::now(),
            })
        })
        .typed_handler::<StatusNotificationRequest, StatusNotificationResponse, _, _>(
            STATUS_NOTIFICATION,
            |ctx, request| async move {
                info!(
                    "{} EVSE {} connector {} is {:?}",
                    ctx.origin(),
                    request.evse_id,
                    request.connector_id,
                    request.connector_status
                );
                Ok(StatusNotificationResponse {})
            },
        )
        .typed_handler::<DataTransferRequest, DataTransferResponse, _, _>(DATA_TRANSFER, move |ctx, request| {
            let defaults = defaults.clone();
            async move {
                let status = if defaults.accepts_vendor(&request.vendor_id) {
                    DataTransferStatus::Accepted
                } else {
                    DataTransferStatus::UnknownVendorId
                };
                debug!("DataTransfer from {} (vendor {}): {:?}", ctx.origin(), request.vendor_id, status);
                Ok(DataTransferResponse { status, data: None })
            }
        })
}

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::provider::UpstreamTransportErrorKind;
use crate::usage::Usage;
use crate::{CooldownReason, CredentialId, Headers, Scope};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Downstream(DownstreamEvent),
    Upstream(UpstreamEvent),
    Operational(OperationalEvent),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownstreamEvent {
    pub trace_id: Option<String>,
    pub at: SystemTime,
    pub user_id: Option<i64>,
    pub user_key_id: Option<i64>,
    pub request_method: String,
    pub request_headers: Headers,
    pub request_path: String,
    pub request_query: Option<String>,
    pub request_body: Option<Vec<u8>>,
    pub response_status: Option<u16>,
    pub response_headers: Headers,
    pub response_body: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamEvent {
    pub trace_id: Option<String>,
    pub at: SystemTime,
    pub user_id: Option<i64>,
    pub user_key_id: Option<i64>,
    pub provider: String,
    pub credential_id: Option<CredentialId>,
    pub internal: bool,
    pub attempt_no: u32,
    pub operation: String,
    pub request_method: String,
    pub request_headers: Headers,
    pub request_path: String,
    pub request_query: Option<String>,
    pub request_body: Option<Vec<u8>>,
    pub response_status: Option<u16>,
    pub response_headers: Headers,
    pub response_body: Option<Vec<u8>>,
    pub usage: Option<Usage>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub transport_kind: Option<UpstreamTransportErrorKind>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OperationalEvent {
    CooldownStart(CooldownStartEvent),
    CooldownEnd(CooldownEndEvent),
    FairCycleReset(FairCycleResetEvent),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CooldownStartEvent {
    pub at: SystemTime,
    pub credential_id: CredentialId,
    pub scope: Scope,
    pub reason: CooldownReason,
    pub until: SystemTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CooldownEndEvent {
    pub at: SystemTime,
    pub credential_id: CredentialId,
    pub scope: Scope,
}

/// Emitted when every credential for a `(provider, scope)` goes exhausted at
/// once and the fair-cycle counters are reset so ordering doesn't starve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FairCycleResetEvent {
    pub at: SystemTime,
    pub provider: String,
    pub scope: Scope,
}

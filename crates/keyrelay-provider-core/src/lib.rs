//! Core provider abstractions for keyrelay.
//!
//! This crate intentionally does **not** depend on axum or any concrete HTTP client.
//! Provider implementations should construct `UpstreamHttpRequest`, while a
//! higher layer performs IO.

pub mod clock;
pub mod config;
pub mod credential;
pub mod errors;
pub mod events;
pub mod headers;
pub mod provider;
pub mod registry;
pub mod usage;

pub use clock::{Clock, FakeClock, SystemClock};
pub use config::{DispatchRule, DispatchTable, ModelTable, OperationKind, ProviderConfig};
pub use credential::{
    Cooldown, CooldownManager, CooldownReason, CooldownSource, Credential, CredentialId,
    CredentialSecret, Scope,
};
pub use errors::{ProviderError, ProviderResult};
pub use events::{
    CooldownEndEvent, CooldownStartEvent, DownstreamEvent, Event, EventHub, EventSink,
    FairCycleResetEvent, OperationalEvent, TerminalEventSink, UpstreamEvent,
};
pub use headers::{Headers, header_get, header_remove, header_set};
pub use provider::{
    Classification, HttpMethod, RotationMode, UpstreamBody, UpstreamClient, UpstreamCtx,
    UpstreamFailure, UpstreamHttpRequest, UpstreamHttpResponse, UpstreamProvider,
    UpstreamTransportErrorKind,
};
pub use registry::ProviderRegistry;
pub use usage::{
    CredentialState, FairCycleEntry, FairCycleExhaustReason, Rejected, ScopeStats, SlotHandle,
    TotalStats, Usage, UsageManager, UsageWindow,
};

//! Wire and persistence contracts shared by every switchboard crate.
//!
//! The envelope shapes (`ingest.v1`, `route.v1`, `notify.v1`) are versioned:
//! extension happens by introducing a new `schema_version`, never by loosening
//! an existing one. All deserialization uses closed field sets.

pub mod envelope;
pub mod errors;
pub mod lifecycle;
pub mod route;

pub use envelope::{
    Attachment, EnvelopeControl, EnvelopeEvent, EnvelopePayload, EnvelopeSender, EnvelopeSource,
    IngestAccepted, IngressEnvelope, ValidationError, SCHEMA_INGEST_V1,
};
pub use errors::ErrorCategory;
pub use lifecycle::{LifecycleState, TransitionError};
pub use route::{
    AbortPolicy, DispatchOutcome, DispatchResponse, FanoutMode, JoinPolicy, NotifyRequestV1,
    ParseSource, PolicyTier, RouteDecision, RouteRequestV1, RouteTarget, SCHEMA_NOTIFY_V1,
    SCHEMA_ROUTE_V1,
};

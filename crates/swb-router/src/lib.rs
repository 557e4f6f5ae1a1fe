//! Routing and dispatch: the fabric between accepted envelopes and the
//! butler roster.
//!
//! The crate splits into the deterministic fanout core ([`fanout`]), the
//! reliability-wrapped single-target dispatcher ([`dispatcher`]), the
//! pluggable transport boundary ([`sink`]), per-conversation ordering
//! ([`thread_order`]), the end-to-end pipeline ([`pipeline`]), and the
//! operator surface ([`ops`]).

pub mod cancel;
pub mod dispatcher;
pub mod fanout;
pub mod maintenance;
pub mod ops;
pub mod pipeline;
pub mod sink;
pub mod thread_order;

pub use cancel::{cancel_pair, ActiveRequests, CancelSource, CancelToken};
pub use dispatcher::TargetDispatcher;
pub use fanout::{execute_fanout, Disposition, FanoutPlan, FanoutResult};
pub use ops::{cancel_request, force_complete, replay, reroute, OperatorActionResult};
pub use pipeline::{IngestVerdict, Pipeline, WorkItem};
pub use sink::{ButlerSink, HttpButlerSink, SinkError};
pub use thread_order::ThreadSerializer;

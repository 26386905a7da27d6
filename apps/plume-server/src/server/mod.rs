pub(crate) mod autoproxy;
pub(crate) mod background;
pub(crate) mod clock;
pub(crate) mod core;
pub(crate) mod db;
pub(crate) mod dispatch;
pub(crate) mod errors;
pub(crate) mod expiry;
pub(crate) mod handlers;
pub(crate) mod lanes;
pub(crate) mod latch;
pub(crate) mod member_cache;
pub(crate) mod metrics;
pub(crate) mod orchestrator;
pub(crate) mod pipeline;
pub(crate) mod rate_limit;
pub(crate) mod relay_registry;
pub(crate) mod repository;
pub(crate) mod router;
pub(crate) mod transport;
pub(crate) mod types;
pub(crate) mod warnings;

pub use autoproxy::{AutoproxyDecision, AutoproxySkip};
pub use background::BackgroundTasks;
pub use clock::{Clock, ManualClock, SystemClock};
pub use core::{AppConfig, AppState};
pub use db::PgRepository;
pub use dispatch::{Delivery, DispatchError, OutboundMessage};
pub use errors::init_tracing;
pub use expiry::Expiry;
pub use lanes::LaneFull;
pub use latch::{LatchLookup, LatchTracker};
pub use member_cache::{MemberCache, MemberCachePolicy, ProxyCandidates};
pub use metrics::ProxyMetrics;
pub use orchestrator::{
    MatchedBy, OrchestratorConfig, ProxyError, ProxyOrchestrator, ProxyOutcome, ProxyReceipt,
    SkipReason,
};
pub use pipeline::{MaintenanceReport, ProxyPipeline};
pub use rate_limit::RateLimiter;
pub use relay_registry::{RelayError, RelayRegistry};
pub use repository::{InMemoryRepository, Repository, RepositoryError};
pub use router::{build_router, build_router_with_pipeline};
pub use transport::{
    HttpRelayTransport, RelayExchange, RelayExecution, RelayHandle, RelayResponseBody,
    RelayTransport, TransportError,
};

#![forbid(unsafe_code)]

mod server;

pub use server::{
    build_router, build_router_with_pipeline, init_tracing, AppConfig, AppState,
    AutoproxyDecision, AutoproxySkip, BackgroundTasks, Clock, Delivery, DispatchError, Expiry,
    HttpRelayTransport, InMemoryRepository, LaneFull, LatchLookup, LatchTracker,
    MaintenanceReport, ManualClock, MatchedBy, MemberCache, MemberCachePolicy,
    OrchestratorConfig, OutboundMessage, PgRepository, ProxyCandidates, ProxyError,
    ProxyMetrics, ProxyOrchestrator, ProxyOutcome, ProxyPipeline, ProxyReceipt, RateLimiter,
    RelayError, RelayExchange, RelayExecution, RelayHandle, RelayRegistry, RelayResponseBody,
    RelayTransport, Repository, RepositoryError, SkipReason, SystemClock, TransportError,
};

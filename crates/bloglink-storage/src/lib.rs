//! Persistence and fetching for the link graph: the `LinkStore` contract with
//! Postgres and in-memory backends, content-addressed evidence files, and the
//! rate-limited HTTP page fetcher.

pub mod evidence;
pub mod fetch;
pub mod memory;
pub mod postgres;
pub mod store;

pub use evidence::{EvidenceStore, StoredEvidence};
pub use fetch::{
    BackoffPolicy, FetchError, FetchedResponse, HttpClientConfig, HttpFetcher, PageFetcher,
    RateLimit, RateLimiter,
};
pub use memory::MemoryLinkStore;
pub use postgres::PgLinkStore;
pub use store::{
    CandidateUpsert, ClaimedCandidate, FinishOutcome, GraphSnapshot, LinkStore, NewCandidate,
    NewEdge, QueueStats, Resolution, SiteUpsert, StoreError,
};

pub const CRATE_NAME: &str = "bloglink-storage";

//! Persistence boundary + HTTP fetch utilities for MCF.

mod fetch;
mod store;

pub use fetch::{
    classify_status, default_user_agents, FetchError, FetchFailure, FetchedPage,
    HttpClientConfig, HttpFetcher, PageTransport, RequestHeaders, ReqwestTransport,
    RetryDisposition, RetryPolicy, TransportError, TransportResponse, UserAgentPool, ACCEPT_HTML,
    ACCEPT_LANGUAGE_EN, DEFAULT_USER_AGENT, DEFAULT_USER_AGENTS, MAX_REDIRECTS,
};
pub use reqwest::StatusCode;
pub use store::{Clock, ListingUpsert, PostUpsert, SqliteStore, Store, StoreError};

pub const CRATE_NAME: &str = "mcf-storage";

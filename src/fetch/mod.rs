//! HTTP transport and the paginated record source built on top of it.

mod basic;
mod client;
mod source;
pub mod auth;

pub use auth::ApiKey;
pub use basic::BasicClient;
pub use client::HttpClient;
pub use source::{
    FetchOutcome, PageCursor, PageQuery, RecordSource, RetryPolicy, Row, RowFilter, SodaClient,
    fetch, fetch_page_with_retry,
};

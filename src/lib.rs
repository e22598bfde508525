pub mod config;
pub mod datasets;
pub mod error;
pub mod fetch;
pub mod ingest;
pub mod normalize;
pub mod parcel;
pub mod pipeline;
pub mod report;
pub mod score;
pub mod tract;

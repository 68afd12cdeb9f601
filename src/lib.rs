//! Candidate sourcing pipeline: portal search, deduplicated storage and
//! webhook-driven call automation.

pub mod acquisition;
pub mod config;
pub mod error;
pub mod gateway;
pub mod models;
pub mod pipeline;
pub mod secret;
pub mod store;
pub mod transport;

pub use acquisition::{Acquisition, CandidateFilter, PortalConfig, SearchLimits, SearchStream};
pub use error::{PipelineError, Result};
pub use gateway::{Destination, DispatchReport, DispatchState, GatewayConfig, JobData, WebhookGateway};
pub use pipeline::{Pipeline, SearchReport};
pub use store::Store;
pub use transport::{RateLimitedTransport, Scheduler, TransportConfig};

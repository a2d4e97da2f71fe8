//! High-throughput client for CRM REST APIs that throttle on two axes:
//! a token bucket on request admission and a sliding window on total
//! request-processing seconds per method. The scheduler keeps traffic
//! just under both limits, packs work into 50-command multicalls, fans
//! pagination out in parallel and recovers from load shedding on its own.
//!
//! ```no_run
//! use fastcrm::Client;
//! use serde_json::json;
//!
//! # async fn demo() -> Result<(), fastcrm::ClientError> {
//! let client = Client::new("https://acme.example.com/rest/1/secret/")?;
//!
//! let deals = client
//!     .get_all("crm.deal.list", json!({"select": ["ID", "TITLE"]}).as_object().cloned())
//!     .await?;
//! println!("{} deals", deals.len());
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod client;
pub mod config;
pub mod error;
pub mod paginate;
pub mod params;
pub mod response;
pub mod scheduler;
pub mod throttle;
pub mod transport;
pub mod wire;

pub use client::{BlockingClient, Client, ClientBuilder, SlowGuard};
pub use config::ClientConfig;
pub use error::ClientError;
pub use params::Params;
pub use response::{ExtractMode, Payload, ServerResponse};
pub use transport::{HttpTransport, ReqwestTransport, TokenProvider, TransportError};

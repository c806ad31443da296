pub mod broker;
pub mod client;
pub mod config;
pub mod error;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod traits;
pub mod transport;
pub mod worker;

pub use broker::Broker;
pub use client::Client;
pub use config::{BrokerSettings, ClientSettings, DrehscheibeConfig, WorkerSettings};
pub use error::DrehscheibeError;
pub use metrics::{BrokerStatsSnapshot, ClientStatsSnapshot};
pub use protocol::{
    generate_message_id, generate_nonce, ClientCommand, ClientMessage, ServiceRequest,
    ServiceResponse, WorkerCommand, WorkerMessage, GATEWAY_CLIENT_ID, HUB_CONTROL_SERVICE,
};
pub use registry::{ServiceSnapshot, WorkerSnapshot};
pub use traits::{DeviceListHook, RequestHandler};
pub use transport::{CurveKeys, Transport};
pub use worker::{Worker, WorkerBuilder, WorkerState};

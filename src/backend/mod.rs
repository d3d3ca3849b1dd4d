pub mod cache;
pub mod circuit_breaker;
pub mod client;
pub mod metrics;
pub mod realtime;
pub mod retry;
pub mod transport;

pub use circuit_breaker::CircuitState;
pub use client::{BackendClient, RequestOptions};
pub use metrics::ClientMetrics;
pub use realtime::{RealtimeChannel, RealtimeConnector, RealtimeStatus, WebSocketConnector};
pub use transport::{HttpRequest, HttpResponse, HttpTransport, Method, ReqwestTransport};

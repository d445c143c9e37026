mod client;
mod refresh;
mod transport;

pub use client::{ApiClient, ApiError};
pub use refresh::{
    HttpTokenRefresher, RefreshCoordinator, RefreshError, RefreshOutcome, RefreshPhase,
    TokenRefresher,
};
pub use transport::{
    ApiRequest, ApiResponse, HttpTransport, Method, ReqwestTransport, TransportError,
};

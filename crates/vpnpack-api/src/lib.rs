// vpnpack-api: wire clients for the gateway's udapi socket and the Network Integration API

pub mod error;
pub mod integration;
pub mod transport;
pub mod udapi;

pub use error::Error;
pub use integration::IntegrationClient;
pub use transport::TransportConfig;
pub use udapi::UdapiClient;

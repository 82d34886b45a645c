// Client for the Network application's Integration API.
//
// Only the surfaces the daemon needs: application info, sites, and
// firewall zones/policies. Uses `X-API-Key` authentication.

pub mod client;
pub mod types;

pub use client::IntegrationClient;

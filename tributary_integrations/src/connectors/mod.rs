//! Provider adapters implementing `tributary_core::ProviderAdapter`, one module per provider.

#[cfg(feature = "github")]
pub mod github;
#[cfg(feature = "google_calendar")]
pub mod google_calendar;
#[cfg(feature = "linear")]
pub mod linear;
#[cfg(feature = "readwise")]
pub mod readwise;
pub mod shared;

#[cfg(test)]
mod test_server;

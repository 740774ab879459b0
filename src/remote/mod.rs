mod client;
#[cfg(test)]
pub mod fake_endpoint;
pub mod prompb;
mod selector;

pub use client::{Auth, ClientOptions, RemoteClient};
pub use selector::{parse_selector, DEFAULT_SELECTOR};

//! Trellis Connection Strategy
//!
//! Reaching the platform on a hostile network is half the job: this
//! crate dials HTTPS and WebSocket endpoints through a weighted pool of
//! obfuscated paths (TLS fragmentation, record reordering, third-party
//! extender relays) and grows the pool with DoH-discovered extenders
//! when everything known fails.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod dialer;
pub mod doh;
pub mod error;
pub mod extender;
pub mod resilient;
pub mod settings;
pub mod strategy;

pub use dialer::{Dialer, DialerKind, DialerStats};
pub use doh::DohResolver;
pub use error::{ConnectError, Result};
pub use extender::{ExtenderConfig, ExtenderProfile, dial_extender, enumerate_profiles};
pub use resilient::{ResilientMode, ResilientTlsStream, client_hello_sni_range};
pub use settings::ClientStrategySettings;
pub use strategy::{AsyncStream, ClientStrategy, DialOutcome, IoStream};

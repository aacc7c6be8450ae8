//! Access certificate lifecycle: tracking, expiry monitoring and renewal.

pub mod authority;
pub mod error;
pub mod parse;
pub mod paths;
pub mod scheduler;
pub mod state;
pub mod store;

pub use authority::{CertAuthority, CliAuthority};
pub use error::CertError;
pub use paths::{CertPaths, expand_home};
pub use scheduler::RenewalScheduler;
pub use state::{
    CertEventKind, CertState, CertStatus, CertStatusEvent, RenewalPolicy, format_remaining,
};
pub use store::{CertRecord, CertificateStore};

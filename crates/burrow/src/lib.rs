//! Supervision of bastion tunnel processes and the access certificates
//! that sessions through them depend on.
//!
//! - [`tunnel::TunnelSupervisor`] runs one relay CLI child per tunnel id,
//!   classifies its output into status transitions and keeps a bounded log.
//! - [`cert::RenewalScheduler`] tracks certificates per identity and renews
//!   them inside the renewal window.
//!
//! Both report progress on bounded lossy queues (see [`events`]); the query
//! operations are authoritative.

pub mod cert;
pub mod events;
pub mod tunnel;

//! Multipath tunneling dataplane: bearer transports, duplicate detection,
//! the logical address allocator, the virtual interface manager, the
//! multipath tunnel manager that ties them together, and the supporting
//! config/hosts/route/sip seams around it.

pub mod alloc;
pub mod bearer;
pub mod config;
pub mod dedup;
pub mod hosts;
pub mod manager;
pub mod queue;
pub mod route;
pub mod sip;
pub mod vif;

//! Host functions available to PAC scripts
//!
//! Everything here is plain Rust with no script engine types, so the
//! functions can be tested on their own. [`crate::sandbox`] binds them under
//! their Netscape names.

pub mod calendar;
pub mod host;

pub use calendar::{date_range, time_range, weekday_range};
pub use host::{
    convert_addr, dns_domain_is, dns_domain_levels, dns_resolve, is_in_net, is_plain_host_name,
    is_resolvable, local_host_or_domain_is, my_ip_address, sh_exp_match,
};

use chrono::{DateTime, FixedOffset, Local};

/// Source of "now" for the calendar functions.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<FixedOffset>;
}

/// Wall clock in the local timezone.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<FixedOffset> {
        Local::now().fixed_offset()
    }
}

/// A clock stopped at one instant, for tests and reproducible evaluation.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<FixedOffset>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<FixedOffset> {
        self.0
    }
}

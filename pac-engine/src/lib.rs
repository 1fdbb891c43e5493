//! PAC resolution engine for pacproxy
//!
//! Evaluates Proxy Auto-Configuration scripts in a sandbox, parses their
//! verdicts and tracks which upstream proxies are reachable.

pub mod config;
pub mod directive;
pub mod error;
pub mod health;
pub mod pacfunc;
pub mod resolver;
pub mod sandbox;
pub mod selector;
pub mod source;

// Re-export commonly used types
pub use config::{Config, ConfigLoader, ConfigValidator};
pub use directive::{ProxyDirective, ProxyDirectiveList};
pub use error::{DialError, DirectiveError, InvocationError, PacError, Result, ValidationError};
pub use health::{
    Dialer, HealthSettings, ProxyHealthRegistry, TcpDialer, UpstreamState, UpstreamStatus,
};
pub use pacfunc::{Clock, FixedClock, SystemClock};
pub use resolver::{PacResolver, ResolverOptions, DIRECT_PAC};
pub use sandbox::{PacSandbox, SandboxLimits};
pub use selector::{FirstItemSelector, HealthAwareSelector, ProxySelector};
pub use source::PacSource;

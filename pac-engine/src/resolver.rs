//! Thread-safe, reloadable PAC resolution
//!
//! [`PacResolver`] owns the current script and the upstream health registry.
//! One mutex guards the script snapshot, and every evaluation runs while
//! holding it. A load builds the new sandbox before taking the lock, so a
//! caller either sees the old script or the complete new one.

use crate::directive::{self, ProxyDirective};
use crate::error::{PacError, Rejection, Result};
use crate::health::{Dialer, HealthSettings, ProxyHealthRegistry, TcpDialer};
use crate::pacfunc::{Clock, SystemClock};
use crate::sandbox::{PacSandbox, SandboxLimits};
use crate::selector::{FirstItemSelector, ProxySelector};
use crate::source::PacSource;
use std::net::TcpStream;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Script used before anything is loaded and after an unload.
pub const DIRECT_PAC: &str = r#"function FindProxyForURL(url, host) { return "DIRECT"; }"#;

/// Everything needed to construct a [`PacResolver`].
#[derive(Clone)]
pub struct ResolverOptions {
    pub health: HealthSettings,
    pub limits: SandboxLimits,
    /// Whether [`PacResolver::reload`] forgets upstream health.
    pub reset_health_on_reload: bool,
    pub clock: Arc<dyn Clock>,
    pub dialer: Arc<dyn Dialer>,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            health: HealthSettings::default(),
            limits: SandboxLimits::default(),
            reset_health_on_reload: true,
            clock: Arc::new(SystemClock),
            dialer: Arc::new(TcpDialer),
        }
    }
}

/// A loaded script and where it came from.
#[derive(Debug)]
struct PacScript {
    sandbox: PacSandbox,
    origin: Option<PacSource>,
}

pub struct PacResolver {
    script: Mutex<Arc<PacScript>>,
    registry: Arc<ProxyHealthRegistry>,
    selector: Arc<dyn ProxySelector>,
    limits: SandboxLimits,
    clock: Arc<dyn Clock>,
    reset_health_on_reload: bool,
}

impl std::fmt::Debug for PacResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacResolver")
            .field("registry", &self.registry)
            .field("limits", &self.limits)
            .field("reset_health_on_reload", &self.reset_health_on_reload)
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PacResolver {
    /// A resolver with default options and the always-`DIRECT` script.
    pub fn new() -> Result<Self> {
        Self::with_options(ResolverOptions::default())
    }

    pub fn with_options(options: ResolverOptions) -> Result<Self> {
        let sandbox = PacSandbox::with_options(DIRECT_PAC, options.limits, options.clock.clone())?;
        let registry = Arc::new(ProxyHealthRegistry::with_dialer(
            options.health,
            options.dialer,
        ));

        Ok(Self {
            script: Mutex::new(Arc::new(PacScript {
                sandbox,
                origin: None,
            })),
            registry,
            selector: Arc::new(FirstItemSelector),
            limits: options.limits,
            clock: options.clock,
            reset_health_on_reload: options.reset_health_on_reload,
        })
    }

    /// Replace the strategy used by [`select`](Self::select).
    pub fn with_selector(mut self, selector: Arc<dyn ProxySelector>) -> Self {
        self.selector = selector;
        self
    }

    pub fn registry(&self) -> &Arc<ProxyHealthRegistry> {
        &self.registry
    }

    fn compile(&self, text: &str) -> Result<PacSandbox> {
        PacSandbox::with_options(text, self.limits, self.clock.clone())
    }

    fn swap(&self, sandbox: PacSandbox, origin: Option<PacSource>) {
        *lock(&self.script) = Arc::new(PacScript { sandbox, origin });
    }

    /// Load a script. On error the previous script stays in place.
    pub fn load(&self, text: &str) -> Result<()> {
        let sandbox = self.compile(text)?;
        self.swap(sandbox, None);
        tracing::info!(bytes = text.len(), "loaded PAC script");
        Ok(())
    }

    /// Load a script and remember where it came from, for later reloads.
    pub fn load_from(&self, text: &str, origin: PacSource) -> Result<()> {
        let sandbox = self.compile(text)?;
        tracing::info!(bytes = text.len(), %origin, "loaded PAC script");
        self.swap(sandbox, Some(origin));
        Ok(())
    }

    /// Swap in new text for the current origin.
    ///
    /// Clears the health registry when the resolver was built with
    /// `reset_health_on_reload`.
    pub fn reload(&self, text: &str) -> Result<()> {
        let sandbox = self.compile(text)?;
        {
            let mut script = lock(&self.script);
            if self.reset_health_on_reload {
                self.registry.clear();
            }
            let origin = script.origin.clone();
            *script = Arc::new(PacScript { sandbox, origin });
        }
        tracing::info!(
            bytes = text.len(),
            reset_health = self.reset_health_on_reload,
            "reloaded PAC script"
        );
        Ok(())
    }

    /// Revert to the built-in always-`DIRECT` script.
    pub fn unload(&self) -> Result<()> {
        let sandbox = self.compile(DIRECT_PAC)?;
        self.swap(sandbox, None);
        tracing::info!("unloaded PAC script");
        Ok(())
    }

    /// Text of the current script.
    pub fn source(&self) -> String {
        lock(&self.script).sandbox.source().to_string()
    }

    pub fn origin(&self) -> Option<PacSource> {
        lock(&self.script).origin.clone()
    }

    /// Raw `FindProxyForURL(url, host)` result.
    pub fn resolve_verdict(&self, url: &str, host: &str) -> Result<String> {
        let script = lock(&self.script);
        Ok(script.sandbox.invoke(url, host)?)
    }

    /// Resolve `url` to the first usable directive.
    ///
    /// Candidates are tried in verdict order. `DIRECT` is always usable and
    /// a proxy is usable when the registry can reach it. If none is, the
    /// error lists why each candidate was passed over.
    pub fn resolve(&self, url: &str) -> Result<ProxyDirective> {
        let host = host_from_url(url);
        let script = lock(&self.script);

        let verdict = script.sandbox.invoke(url, &host)?;
        let candidates = directive::parse(&verdict)?;
        tracing::debug!(url, host = %host, verdict = %verdict, "evaluated PAC");

        if candidates.is_empty() {
            return Err(PacError::EmptyVerdict {
                url: url.to_string(),
                host,
            });
        }

        let mut rejected = Vec::new();
        for candidate in &candidates {
            let Some(address) = candidate.address() else {
                return Ok(candidate.clone());
            };
            if self.registry.probe(&address) {
                return Ok(candidate.clone());
            }

            let reason = self
                .registry
                .last_error(&address)
                .map(|e| e.to_string())
                .unwrap_or_else(|| format!("{address} is unavailable"));
            tracing::debug!(candidate = %candidate, reason = %reason, "skipping candidate");
            rejected.push(Rejection {
                directive: candidate.clone(),
                reason,
            });
        }

        Err(PacError::Unresolvable {
            url: url.to_string(),
            host,
            verdict,
            rejected,
        })
    }

    /// Evaluate the script and let the configured selector pick, without
    /// dialing anything.
    pub fn select(&self, url: &str) -> Result<ProxyDirective> {
        let host = host_from_url(url);
        let script = lock(&self.script);

        let verdict = script.sandbox.invoke(url, &host)?;
        let candidates = directive::parse(&verdict)?;
        Ok(self.selector.select_proxy(&candidates))
    }

    /// Connection to the upstream named by `directive`, or `None` for
    /// `DIRECT`, where the caller connects to the origin itself.
    pub fn dial(&self, directive: &ProxyDirective) -> Result<Option<TcpStream>> {
        match directive.address() {
            Some(address) => Ok(Some(self.registry.dial(&address)?)),
            None => Ok(None),
        }
    }
}

/// Host part of a request URL or `host:port` authority, without the port.
///
/// The host text is passed through as written, with no case folding or
/// IDNA encoding.
pub fn host_from_url(url: &str) -> String {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let authority = rest.split(['/', '?', '#']).next().unwrap_or(rest);
    let authority = authority.rsplit_once('@').map_or(authority, |(_, host)| host);

    if let Some(bracketed) = authority.strip_prefix('[') {
        return bracketed
            .split_once(']')
            .map_or(bracketed, |(host, _)| host)
            .to_string();
    }
    match authority.split_once(':') {
        Some((host, port)) if !port.contains(':') => host.to_string(),
        _ => authority.to_string(),
    }
}

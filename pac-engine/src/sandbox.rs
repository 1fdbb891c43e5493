//! PAC script sandbox using Boa Engine
//!
//! # Script Interface
//!
//! The loaded source must define a global function:
//!
//! ```javascript
//! function FindProxyForURL(url, host) {
//!     if (isPlainHostName(host) || dnsDomainIs(host, ".corp.example.com")) {
//!         return "DIRECT";
//!     }
//!     return "PROXY proxy.example.com:8080; DIRECT";
//! }
//! ```
//!
//! ## Host functions
//!
//! - `isPlainHostName(host)`, `dnsDomainIs(host, domain)`,
//!   `localHostOrDomainIs(host, hostdom)`, `dnsDomainLevels(host)`
//! - `isResolvable(host)`, `dnsResolve(host)`, `myIpAddress()`,
//!   `isInNet(host, netip, netmask)`, `convertAddr(ip)`
//! - `shExpMatch(str, shexp)`
//! - `weekdayRange(wd1 [, wd2] [, "GMT"])`, `dateRange(...)`, `timeRange(...)`
//!
//! `console.log/info/warn/error/debug/assert/clear` and `alert(...)` write
//! to the `pac::script` tracing target.
//!
//! Each sandbox owns one script context on a dedicated evaluator thread.
//! Top-level code runs once, when the sandbox is built, and every
//! invocation is queued to that thread and runs against the same globals.
//! A reload builds a new sandbox; the old thread exits once the last handle
//! to it is dropped.

use crate::error::{InvocationError, PacError, Result};
use crate::pacfunc::{self, Clock, SystemClock};
use boa_engine::{
    js_string, native_function::NativeFunction, property::PropertyKey, Context, JsError, JsObject,
    JsResult, JsValue, Source,
};
use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
use std::cell::RefCell;
use std::sync::Arc;
use std::thread;

const SCRIPT_TARGET: &str = "pac::script";

/// Name of the entry point every PAC script must define.
pub const ENTRY_POINT: &str = "FindProxyForURL";

type HostFn = fn(&JsValue, &[JsValue], &mut Context) -> JsResult<JsValue>;

const HOST_FUNCTIONS: &[(&str, HostFn)] = &[
    ("isPlainHostName", is_plain_host_name),
    ("dnsDomainIs", dns_domain_is),
    ("localHostOrDomainIs", local_host_or_domain_is),
    ("isResolvable", is_resolvable),
    ("dnsResolve", dns_resolve),
    ("dnsDomainLevels", dns_domain_levels),
    ("isInNet", is_in_net),
    ("shExpMatch", sh_exp_match),
    ("convertAddr", convert_addr),
    ("myIpAddress", my_ip_address),
    ("weekdayRange", weekday_range),
    ("dateRange", date_range),
    ("timeRange", time_range),
    ("alert", alert),
];

const CONSOLE_METHODS: &[(&str, HostFn)] = &[
    ("log", console_log),
    ("info", console_info),
    ("warn", console_warn),
    ("error", console_error),
    ("debug", console_debug),
    ("assert", console_assert),
    ("clear", console_clear),
];

// Clock used by the calendar functions on an evaluator thread
thread_local! {
    static CURRENT_CLOCK: RefCell<Option<Arc<dyn Clock>>> = const { RefCell::new(None) };
}

fn set_current_clock(clock: Arc<dyn Clock>) {
    CURRENT_CLOCK.with(|c| {
        *c.borrow_mut() = Some(clock);
    });
}

fn with_current_clock<T>(f: impl FnOnce(&dyn Clock) -> T) -> T {
    CURRENT_CLOCK.with(|c| match c.borrow().as_ref() {
        Some(clock) => f(clock.as_ref()),
        None => f(&SystemClock),
    })
}

/// Resource limits applied to every script context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SandboxLimits {
    pub loop_iteration_limit: u64,
    pub recursion_limit: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            loop_iteration_limit: 1_000_000,
            recursion_limit: 512,
        }
    }
}

/// One `FindProxyForURL` call queued for the evaluator thread.
struct Invocation {
    url: String,
    host: String,
    reply: Sender<std::result::Result<String, InvocationError>>,
}

/// A compiled PAC script with its host bindings. Immutable once built.
///
/// Clones share the same evaluator thread and therefore the same globals.
#[derive(Clone)]
pub struct PacSandbox {
    source: Arc<str>,
    limits: SandboxLimits,
    requests: Sender<Invocation>,
}

impl std::fmt::Debug for PacSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacSandbox")
            .field("source_len", &self.source.len())
            .field("limits", &self.limits)
            .finish()
    }
}

impl PacSandbox {
    pub fn new(source: &str) -> Result<Self> {
        Self::with_options(source, SandboxLimits::default(), Arc::new(SystemClock))
    }

    /// Compile `source` and run its top-level code, failing with
    /// [`PacError::Compile`] on syntax errors or an exception thrown by
    /// top-level code.
    pub fn with_options(
        source: &str,
        limits: SandboxLimits,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let source: Arc<str> = Arc::from(source);
        let (requests, inbox) = unbounded();
        let (ready_tx, ready) = bounded(1);

        let script = source.clone();
        thread::Builder::new()
            .name("pac-evaluator".to_string())
            .spawn(move || evaluate(&script, limits, clock, ready_tx, inbox))
            .map_err(PacError::Evaluator)?;

        match ready.recv() {
            Ok(Ok(())) => {}
            Ok(Err(message)) => return Err(PacError::Compile { message }),
            Err(_) => {
                return Err(PacError::Compile {
                    message: "evaluator stopped while loading the script".to_string(),
                })
            }
        }

        tracing::debug!(bytes = source.len(), "compiled PAC script");
        Ok(Self {
            source,
            limits,
            requests,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn limits(&self) -> SandboxLimits {
        self.limits
    }

    /// Call `FindProxyForURL(url, host)` and coerce the result to a string.
    pub fn invoke(&self, url: &str, host: &str) -> std::result::Result<String, InvocationError> {
        let (reply, verdict) = bounded(1);
        self.requests
            .send(Invocation {
                url: url.to_string(),
                host: host.to_string(),
                reply,
            })
            .map_err(|_| InvocationError::Unavailable)?;

        verdict.recv().map_err(|_| InvocationError::Unavailable)?
    }
}

/// Evaluator thread body: build the context, report readiness, then serve
/// invocations until every sender is gone.
fn evaluate(
    source: &str,
    limits: SandboxLimits,
    clock: Arc<dyn Clock>,
    ready: Sender<std::result::Result<(), String>>,
    inbox: Receiver<Invocation>,
) {
    set_current_clock(clock);

    let mut context = match build_context(source, limits) {
        Ok(context) => context,
        Err(e) => {
            let _ = ready.send(Err(e.to_string()));
            return;
        }
    };
    if ready.send(Ok(())).is_err() {
        return;
    }

    for call in inbox {
        let verdict = call_entry_point(&mut context, &call.url, &call.host);
        let _ = call.reply.send(verdict);
    }
    tracing::debug!("PAC evaluator stopped");
}

fn build_context(source: &str, limits: SandboxLimits) -> JsResult<Context> {
    let mut context = Context::default();
    context
        .runtime_limits_mut()
        .set_loop_iteration_limit(limits.loop_iteration_limit);
    context
        .runtime_limits_mut()
        .set_recursion_limit(limits.recursion_limit);

    register_globals(&mut context)?;
    context.eval(Source::from_bytes(source.as_bytes()))?;
    Ok(context)
}

fn call_entry_point(
    context: &mut Context,
    url: &str,
    host: &str,
) -> std::result::Result<String, InvocationError> {
    let thrown = |e: JsError| InvocationError::Thrown(e.to_string());

    let global = context.global_object();
    let entry = global
        .get(js_string!(ENTRY_POINT), context)
        .map_err(thrown)?;
    if entry.is_undefined() {
        return Err(InvocationError::Undefined);
    }
    let entry = entry.as_callable().ok_or(InvocationError::NotCallable)?;

    let args = [
        JsValue::from(js_string!(url)),
        JsValue::from(js_string!(host)),
    ];
    let verdict = entry
        .call(&JsValue::undefined(), &args, context)
        .map_err(thrown)?;

    let verdict = verdict.to_string(context).map_err(thrown)?;
    Ok(verdict.to_std_string_escaped())
}

/// Register a native function on a JS object.
fn register_method(
    obj: &JsObject,
    name: &str,
    func: HostFn,
    context: &mut Context,
) -> JsResult<()> {
    obj.set(
        PropertyKey::from(js_string!(name)),
        NativeFunction::from_fn_ptr(func).to_js_function(context.realm()),
        false,
        context,
    )
    .map(|_| ())
}

fn register_globals(context: &mut Context) -> JsResult<()> {
    let global = context.global_object();
    for (name, func) in HOST_FUNCTIONS {
        register_method(&global, name, *func, context)?;
    }

    let console = JsObject::with_object_proto(context.intrinsics());
    for (name, func) in CONSOLE_METHODS {
        register_method(&console, name, *func, context)?;
    }
    global.set(js_string!("console"), console, false, context)?;
    Ok(())
}

// Argument coercion follows JS `String(value)`: a missing argument is
// `undefined` and becomes the string "undefined".

fn string_arg(args: &[JsValue], index: usize, context: &mut Context) -> JsResult<String> {
    match args.get(index) {
        Some(value) => Ok(value.to_string(context)?.to_std_string_escaped()),
        None => Ok("undefined".to_string()),
    }
}

/// Like [`string_arg`] but an absent or `undefined` argument is empty.
fn optional_arg(args: &[JsValue], index: usize, context: &mut Context) -> JsResult<String> {
    match args.get(index) {
        Some(value) if !value.is_undefined() && !value.is_null() => {
            Ok(value.to_string(context)?.to_std_string_escaped())
        }
        _ => Ok(String::new()),
    }
}

fn all_args(args: &[JsValue], context: &mut Context) -> JsResult<Vec<String>> {
    args.iter()
        .map(|v| Ok(v.to_string(context)?.to_std_string_escaped()))
        .collect()
}

fn is_plain_host_name(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let host = string_arg(args, 0, ctx)?;
    Ok(JsValue::from(pacfunc::is_plain_host_name(&host)))
}

fn dns_domain_is(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let host = string_arg(args, 0, ctx)?;
    let domain = string_arg(args, 1, ctx)?;
    Ok(JsValue::from(pacfunc::dns_domain_is(&host, &domain)))
}

fn local_host_or_domain_is(
    _this: &JsValue,
    args: &[JsValue],
    ctx: &mut Context,
) -> JsResult<JsValue> {
    let host = string_arg(args, 0, ctx)?;
    let hostdom = string_arg(args, 1, ctx)?;
    Ok(JsValue::from(pacfunc::local_host_or_domain_is(&host, &hostdom)))
}

fn is_resolvable(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let host = string_arg(args, 0, ctx)?;
    Ok(JsValue::from(pacfunc::is_resolvable(&host)))
}

fn dns_resolve(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let host = string_arg(args, 0, ctx)?;
    Ok(JsValue::from(js_string!(pacfunc::dns_resolve(&host))))
}

fn dns_domain_levels(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let host = string_arg(args, 0, ctx)?;
    Ok(JsValue::from(pacfunc::dns_domain_levels(&host) as f64))
}

fn is_in_net(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let host = string_arg(args, 0, ctx)?;
    let netip = string_arg(args, 1, ctx)?;
    let netmask = string_arg(args, 2, ctx)?;
    Ok(JsValue::from(pacfunc::is_in_net(&host, &netip, &netmask)))
}

fn sh_exp_match(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let s = string_arg(args, 0, ctx)?;
    let shexp = string_arg(args, 1, ctx)?;
    Ok(JsValue::from(pacfunc::sh_exp_match(&s, &shexp)))
}

fn convert_addr(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let ip = string_arg(args, 0, ctx)?;
    Ok(JsValue::from(f64::from(pacfunc::convert_addr(&ip))))
}

fn my_ip_address(_this: &JsValue, _args: &[JsValue], _ctx: &mut Context) -> JsResult<JsValue> {
    Ok(JsValue::from(js_string!(pacfunc::my_ip_address())))
}

fn weekday_range(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let wd1 = optional_arg(args, 0, ctx)?;
    let wd2 = optional_arg(args, 1, ctx)?;
    let gmt = optional_arg(args, 2, ctx)?;
    let matched = with_current_clock(|clock| pacfunc::weekday_range(clock, &wd1, &wd2, &gmt));
    Ok(JsValue::from(matched))
}

fn date_range(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let args = all_args(args, ctx)?;
    let matched = with_current_clock(|clock| pacfunc::date_range(clock, &args));
    Ok(JsValue::from(matched))
}

fn time_range(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let args = all_args(args, ctx)?;
    let matched = with_current_clock(|clock| pacfunc::time_range(clock, &args));
    Ok(JsValue::from(matched))
}

fn format_console(args: &[JsValue], ctx: &mut Context) -> String {
    args.iter()
        .map(|v| {
            v.to_string(ctx)
                .map(|s| s.to_std_string_escaped())
                .unwrap_or_else(|_| v.display().to_string())
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn alert(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    tracing::info!(target: SCRIPT_TARGET, "alert: {}", format_console(args, ctx));
    Ok(JsValue::undefined())
}

fn console_log(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    tracing::info!(target: SCRIPT_TARGET, "{}", format_console(args, ctx));
    Ok(JsValue::undefined())
}

fn console_info(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    tracing::info!(target: SCRIPT_TARGET, "{}", format_console(args, ctx));
    Ok(JsValue::undefined())
}

fn console_warn(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    tracing::warn!(target: SCRIPT_TARGET, "{}", format_console(args, ctx));
    Ok(JsValue::undefined())
}

fn console_error(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    tracing::error!(target: SCRIPT_TARGET, "{}", format_console(args, ctx));
    Ok(JsValue::undefined())
}

fn console_debug(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    tracing::debug!(target: SCRIPT_TARGET, "{}", format_console(args, ctx));
    Ok(JsValue::undefined())
}

fn console_assert(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let holds = args.first().is_some_and(JsValue::to_boolean);
    if !holds {
        let rest = args.get(1..).unwrap_or_default();
        tracing::error!(target: SCRIPT_TARGET, "assertion failed: {}", format_console(rest, ctx));
    }
    Ok(JsValue::undefined())
}

fn console_clear(_this: &JsValue, _args: &[JsValue], _ctx: &mut Context) -> JsResult<JsValue> {
    tracing::debug!(target: SCRIPT_TARGET, "console cleared");
    Ok(JsValue::undefined())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pacfunc::FixedClock;
    use chrono::DateTime;

    fn script(body: &str) -> String {
        format!("function FindProxyForURL(url, host) {{ {body} }}")
    }

    #[test]
    fn test_invoke_returns_verdict() {
        let sandbox = PacSandbox::new(&script("return 'DIRECT';")).unwrap();
        assert_eq!(sandbox.invoke("http://example.com/", "example.com").unwrap(), "DIRECT");
    }

    #[test]
    fn test_invoke_passes_url_and_host() {
        let sandbox = PacSandbox::new(&script("return 'PROXY ' + host + ':80; ' + url;")).unwrap();
        assert_eq!(
            sandbox.invoke("http://a.test/x", "a.test").unwrap(),
            "PROXY a.test:80; http://a.test/x"
        );
    }

    #[test]
    fn test_invoke_coerces_result_to_string() {
        let sandbox = PacSandbox::new(&script("return 42;")).unwrap();
        assert_eq!(sandbox.invoke("http://a/", "a").unwrap(), "42");

        let sandbox = PacSandbox::new(&script("return;")).unwrap();
        assert_eq!(sandbox.invoke("http://a/", "a").unwrap(), "undefined");
    }

    #[test]
    fn test_compile_error() {
        let err = PacSandbox::new("function FindProxyForURL(url, host) {").unwrap_err();
        assert!(matches!(err, PacError::Compile { .. }));
    }

    #[test]
    fn test_missing_entry_point() {
        let sandbox = PacSandbox::new("var x = 1;").unwrap();
        assert!(matches!(
            sandbox.invoke("http://a/", "a"),
            Err(InvocationError::Undefined)
        ));
    }

    #[test]
    fn test_entry_point_not_callable() {
        let sandbox = PacSandbox::new("var FindProxyForURL = 'DIRECT';").unwrap();
        assert!(matches!(
            sandbox.invoke("http://a/", "a"),
            Err(InvocationError::NotCallable)
        ));
    }

    #[test]
    fn test_thrown_exception() {
        let sandbox = PacSandbox::new(&script("throw new Error('boom');")).unwrap();
        match sandbox.invoke("http://a/", "a") {
            Err(InvocationError::Thrown(message)) => assert!(message.contains("boom")),
            other => panic!("expected thrown error, got {other:?}"),
        }
    }

    #[test]
    fn test_runaway_loop_is_stopped() {
        let limits = SandboxLimits {
            loop_iteration_limit: 1_000,
            recursion_limit: 64,
        };
        let source = script("while (true) {} return 'DIRECT';");
        let sandbox = PacSandbox::with_options(&source, limits, Arc::new(SystemClock)).unwrap();

        assert!(matches!(
            sandbox.invoke("http://a/", "a"),
            Err(InvocationError::Thrown(_))
        ));

        let top_level = format!("while (true) {{}} {}", script("return 'DIRECT';"));
        let err = PacSandbox::with_options(&top_level, limits, Arc::new(SystemClock)).unwrap_err();
        assert!(matches!(err, PacError::Compile { .. }));
    }

    #[test]
    fn test_top_level_runs_once() {
        let source = "var loads = 0; loads++; var calls = 0; \
            function FindProxyForURL(url, host) { calls++; return 'DIRECT ' + loads + ' ' + calls; }";
        let sandbox = PacSandbox::new(source).unwrap();

        assert_eq!(sandbox.invoke("http://a/", "a").unwrap(), "DIRECT 1 1");
        assert_eq!(sandbox.invoke("http://a/", "a").unwrap(), "DIRECT 1 2");
        // Clones talk to the same context
        assert_eq!(sandbox.clone().invoke("http://a/", "a").unwrap(), "DIRECT 1 3");

        // A rebuilt sandbox starts from fresh globals
        let rebuilt = PacSandbox::new(source).unwrap();
        assert_eq!(rebuilt.invoke("http://a/", "a").unwrap(), "DIRECT 1 1");
    }

    #[test]
    fn test_top_level_tables_are_reused() {
        let source = r#"
            var blocked = {};
            for (var i = 0; i < 20000; i++) { blocked["h" + i + ".test"] = true; }
            function FindProxyForURL(url, host) {
                return blocked[host] ? "PROXY filter.test:3128" : "DIRECT";
            }
        "#;
        let sandbox = PacSandbox::new(source).unwrap();

        for _ in 0..200 {
            assert_eq!(
                sandbox.invoke("http://h42.test/", "h42.test").unwrap(),
                "PROXY filter.test:3128"
            );
            assert_eq!(sandbox.invoke("http://other.test/", "other.test").unwrap(), "DIRECT");
        }
    }

    #[test]
    fn test_context_survives_a_failed_invocation() {
        let limits = SandboxLimits {
            loop_iteration_limit: 1_000,
            recursion_limit: 64,
        };
        let source = script("if (host == 'spin') { while (true) {} } return 'DIRECT';");
        let sandbox = PacSandbox::with_options(&source, limits, Arc::new(SystemClock)).unwrap();

        assert!(sandbox.invoke("http://spin/", "spin").is_err());
        assert_eq!(sandbox.invoke("http://a/", "a").unwrap(), "DIRECT");
    }

    #[test]
    fn test_concurrent_callers_share_one_evaluator() {
        let sandbox = PacSandbox::new(&script("return 'PROXY ' + host + ':1';")).unwrap();

        std::thread::scope(|s| {
            for i in 0..8 {
                let sandbox = &sandbox;
                s.spawn(move || {
                    for j in 0..50 {
                        let host = format!("h{i}-{j}");
                        assert_eq!(
                            sandbox.invoke("http://x/", &host).unwrap(),
                            format!("PROXY {host}:1")
                        );
                    }
                });
            }
        });
    }

    #[test]
    fn test_host_functions_are_bound() {
        let sandbox = PacSandbox::new(&script(
            r#"
            var checks = [
                isPlainHostName("intranet"),
                !isPlainHostName("www.example.com"),
                dnsDomainIs("www.netscape.com", ".netscape.com"),
                localHostOrDomainIs("www", "www.example.com"),
                dnsDomainLevels("www.example.org") === 2,
                shExpMatch(url, "*/ari/*"),
                isInNet("192.168.1.26", "192.168.1.24", "255.255.255.248"),
                convertAddr("10.56.23.193") === 171448257,
                isResolvable("localhost"),
                dnsResolve("localhost") === "127.0.0.1",
                typeof myIpAddress() === "string",
                typeof weekdayRange("MON") === "boolean",
                typeof dateRange("JAN") === "boolean",
                typeof timeRange(0, 24) === "boolean"
            ];
            for (var i = 0; i < checks.length; i++) {
                if (!checks[i]) { return "FAILED " + i; }
            }
            return "DIRECT";
            "#,
        ))
        .unwrap();

        assert_eq!(
            sandbox
                .invoke("http://home.netscape.com/people/ari/index.html", "home.netscape.com")
                .unwrap(),
            "DIRECT"
        );
    }

    #[test]
    fn test_calendar_functions_use_sandbox_clock() {
        let clock = FixedClock(DateTime::parse_from_rfc3339("2018-01-01T10:30:00Z").unwrap());
        let source = script(
            r#"
            if (weekdayRange("MON") && dateRange(1) && !dateRange(2) && timeRange(10, 11)) {
                return "DIRECT";
            }
            return "PROXY fallback:3128";
            "#,
        );
        let sandbox =
            PacSandbox::with_options(&source, SandboxLimits::default(), Arc::new(clock)).unwrap();

        assert_eq!(sandbox.invoke("http://a/", "a").unwrap(), "DIRECT");
    }

    #[test]
    fn test_console_and_alert_do_not_fail() {
        let sandbox = PacSandbox::new(&script(
            r#"
            console.log("resolving", host);
            console.info("info"); console.warn("warn"); console.error("error");
            console.debug({ a: 1 }); console.assert(false, "never"); console.clear();
            alert("legacy");
            return "DIRECT";
            "#,
        ))
        .unwrap();

        assert_eq!(sandbox.invoke("http://a/", "a").unwrap(), "DIRECT");
    }
}

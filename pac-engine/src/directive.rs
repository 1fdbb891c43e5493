//! `FindProxyForURL` verdict parsing
//!
//! A verdict is a `;`-separated list such as `"PROXY proxy.example.com:8080; DIRECT"`.
//! The order of the directives is the order in which callers should try them.

use crate::error::DirectiveError;
use std::fmt;

/// Upper bound on statements in a single verdict, blank ones included.
pub const MAX_STATEMENTS: usize = 50;

/// One entry of a PAC verdict.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ProxyDirective {
    /// Connect to the origin without an upstream.
    Direct,
    /// HTTP proxy.
    Proxy { host: String, port: u16 },
    /// SOCKS5 proxy.
    Socks5 { host: String, port: u16 },
}

impl ProxyDirective {
    pub fn proxy(host: impl Into<String>, port: u16) -> Self {
        ProxyDirective::Proxy {
            host: host.into(),
            port,
        }
    }

    pub fn socks5(host: impl Into<String>, port: u16) -> Self {
        ProxyDirective::Socks5 {
            host: host.into(),
            port,
        }
    }

    pub fn is_direct(&self) -> bool {
        matches!(self, ProxyDirective::Direct)
    }

    /// `host:port` of the upstream, or `None` for `DIRECT`.
    ///
    /// IPv6 literals are bracketed so the result can be dialed as-is.
    pub fn address(&self) -> Option<String> {
        match self {
            ProxyDirective::Direct => None,
            ProxyDirective::Proxy { host, port } | ProxyDirective::Socks5 { host, port } => {
                if host.contains(':') {
                    Some(format!("[{host}]:{port}"))
                } else {
                    Some(format!("{host}:{port}"))
                }
            }
        }
    }
}

impl fmt::Display for ProxyDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyDirective::Direct => write!(f, "DIRECT"),
            ProxyDirective::Proxy { .. } => write!(f, "PROXY {}", self.address().unwrap_or_default()),
            ProxyDirective::Socks5 { .. } => {
                write!(f, "SOCKS5 {}", self.address().unwrap_or_default())
            }
        }
    }
}

/// Ordered candidates from one verdict, most preferred first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyDirectiveList(Vec<ProxyDirective>);

impl ProxyDirectiveList {
    pub fn new(directives: Vec<ProxyDirective>) -> Self {
        Self(directives)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn first(&self) -> Option<&ProxyDirective> {
        self.0.first()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ProxyDirective> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[ProxyDirective] {
        &self.0
    }
}

impl fmt::Display for ProxyDirectiveList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, directive) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{directive}")?;
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a ProxyDirectiveList {
    type Item = &'a ProxyDirective;
    type IntoIter = std::slice::Iter<'a, ProxyDirective>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl IntoIterator for ProxyDirectiveList {
    type Item = ProxyDirective;
    type IntoIter = std::vec::IntoIter<ProxyDirective>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Parse a `FindProxyForURL` verdict into its directives.
///
/// Blank statements are skipped. The first malformed statement aborts the
/// whole parse, so a returned list never holds a partial result.
pub fn parse(verdict: &str) -> Result<ProxyDirectiveList, DirectiveError> {
    let statements: Vec<&str> = verdict.split(';').map(str::trim).collect();
    if statements.len() > MAX_STATEMENTS {
        return Err(DirectiveError::TooManyStatements { max: MAX_STATEMENTS });
    }

    let mut directives = Vec::new();
    for statement in statements {
        if statement.is_empty() {
            continue;
        }

        let (command, argument) = match statement.split_once(char::is_whitespace) {
            Some((command, rest)) => (command, Some(rest.trim_start())),
            None => (statement, None),
        };

        let directive = match command.to_ascii_uppercase().as_str() {
            "DIRECT" => ProxyDirective::Direct,
            "PROXY" => {
                let (host, port) = parse_host_port(statement, argument)?;
                ProxyDirective::Proxy { host, port }
            }
            "SOCKS5" => {
                let (host, port) = parse_host_port(statement, argument)?;
                ProxyDirective::Socks5 { host, port }
            }
            _ => return Err(DirectiveError::UnsupportedCommand(command.to_string())),
        };
        directives.push(directive);
    }

    Ok(ProxyDirectiveList::new(directives))
}

fn parse_host_port(
    statement: &str,
    argument: Option<&str>,
) -> Result<(String, u16), DirectiveError> {
    let argument = argument
        .filter(|a| !a.is_empty())
        .ok_or_else(|| DirectiveError::MissingArgument(statement.to_string()))?;
    let invalid = || DirectiveError::InvalidAddress(argument.to_string());

    let (host, port) = argument.rsplit_once(':').ok_or_else(invalid)?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    if host.is_empty() || host.contains(|c: char| c == '/' || c == '@' || c.is_whitespace()) {
        return Err(invalid());
    }
    if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let port: u16 = port.parse().map_err(|_| invalid())?;

    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(directives: Vec<ProxyDirective>) -> ProxyDirectiveList {
        ProxyDirectiveList::new(directives)
    }

    #[test]
    fn test_parse_direct() {
        assert_eq!(parse("DIRECT").unwrap(), list(vec![ProxyDirective::Direct]));
    }

    #[test]
    fn test_parse_proxy_then_direct() {
        assert_eq!(
            parse("PROXY a:1; DIRECT").unwrap(),
            list(vec![ProxyDirective::proxy("a", 1), ProxyDirective::Direct])
        );
    }

    #[test]
    fn test_parse_keeps_textual_order() {
        let parsed = parse(
            "PROXY proxy.example.com:8080; DIRECT; SOCKS5 socks.example.org:1080; PROXY proxy.example.org:8888",
        )
        .unwrap();

        assert_eq!(
            parsed,
            list(vec![
                ProxyDirective::proxy("proxy.example.com", 8080),
                ProxyDirective::Direct,
                ProxyDirective::socks5("socks.example.org", 1080),
                ProxyDirective::proxy("proxy.example.org", 8888),
            ])
        );
    }

    #[test]
    fn test_parse_skips_blank_statements() {
        assert_eq!(
            parse("PROXY proxy.example.com:8080;  ; ;;").unwrap(),
            list(vec![ProxyDirective::proxy("proxy.example.com", 8080)])
        );
        assert!(parse("").unwrap().is_empty());
        assert!(parse(" ; ; ").unwrap().is_empty());
    }

    #[test]
    fn test_parse_command_is_case_insensitive() {
        assert_eq!(
            parse("proxy a:1; Direct; socks5 b:2").unwrap(),
            list(vec![
                ProxyDirective::proxy("a", 1),
                ProxyDirective::Direct,
                ProxyDirective::socks5("b", 2),
            ])
        );
    }

    #[test]
    fn test_parse_tolerates_whitespace_runs() {
        assert_eq!(
            parse("  PROXY \t a:1  ;DIRECT").unwrap(),
            list(vec![ProxyDirective::proxy("a", 1), ProxyDirective::Direct])
        );
    }

    #[test]
    fn test_parse_unsupported_command() {
        let err = parse("FOO").unwrap_err();
        assert_eq!(err, DirectiveError::UnsupportedCommand("FOO".to_string()));
        assert!(err.to_string().contains("unsupported"));

        // A bad statement anywhere discards the whole list
        assert!(parse("PROXY a:1; HTTPS b:2").is_err());
    }

    #[test]
    fn test_parse_proxy_without_argument() {
        assert_eq!(
            parse("PROXY").unwrap_err(),
            DirectiveError::MissingArgument("PROXY".to_string())
        );
        assert!(parse("SOCKS5").is_err());
    }

    #[test]
    fn test_parse_rejects_bad_addresses() {
        assert_eq!(
            parse("PROXY proxy.example.com").unwrap_err(),
            DirectiveError::InvalidAddress("proxy.example.com".to_string())
        );
        assert_eq!(
            parse("PROXY http://foo.bar:8080").unwrap_err(),
            DirectiveError::InvalidAddress("http://foo.bar:8080".to_string())
        );
        assert!(parse("PROXY :8080").is_err());
        assert!(parse("PROXY host:").is_err());
        assert!(parse("PROXY host:port").is_err());
        assert!(parse("PROXY host:70000").is_err());
        assert!(parse("PROXY host:1 extra").is_err());
    }

    #[test]
    fn test_parse_ipv6_literal() {
        let parsed = parse("PROXY [::1]:3128").unwrap();
        let directive = parsed.first().unwrap();

        assert_eq!(directive, &ProxyDirective::proxy("::1", 3128));
        assert_eq!(directive.address().as_deref(), Some("[::1]:3128"));
    }

    #[test]
    fn test_parse_rejects_too_many_statements() {
        let verdict = vec!["DIRECT"; MAX_STATEMENTS + 1].join(";");
        assert_eq!(
            parse(&verdict).unwrap_err(),
            DirectiveError::TooManyStatements { max: MAX_STATEMENTS }
        );

        let verdict = vec!["DIRECT"; MAX_STATEMENTS].join(";");
        assert_eq!(parse(&verdict).unwrap().len(), MAX_STATEMENTS);
    }

    #[test]
    fn test_directive_display() {
        let parsed = parse("PROXY a:1; SOCKS5 b:2; DIRECT").unwrap();
        assert_eq!(parsed.to_string(), "PROXY a:1; SOCKS5 b:2; DIRECT");
        assert_eq!(ProxyDirective::Direct.address(), None);
    }
}

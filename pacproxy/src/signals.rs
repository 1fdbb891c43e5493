//! Runtime control through signals
//!
//! SIGHUP reloads the PAC script from where it was loaded and SIGUSR1 logs
//! the state of every upstream seen so far.

use pac_engine::{PacResolver, PacSource};
use std::sync::Arc;
use tracing::{info, warn};

#[cfg(unix)]
pub fn spawn(resolver: Arc<PacResolver>) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    let mut user1 = signal(SignalKind::user_defined1())?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(()) = hangup.recv() => {
                    info!("Received SIGHUP");
                    if let Err(e) = reload(&resolver).await {
                        warn!("Reload failed, keeping the current script: {:#}", e);
                    }
                }
                Some(()) = user1.recv() => {
                    info!("Received SIGUSR1");
                    report(&resolver);
                }
                else => break,
            }
        }
    });

    Ok(())
}

#[cfg(not(unix))]
pub fn spawn(_resolver: Arc<PacResolver>) -> anyhow::Result<()> {
    Ok(())
}

/// Re-read the script from its origin, or just forget upstream health when
/// there is nothing to re-read.
pub async fn reload(resolver: &Arc<PacResolver>) -> anyhow::Result<()> {
    let origin = match resolver.origin() {
        Some(PacSource::Inline(_)) | None => {
            info!("PAC script has no reloadable source, clearing upstream status only");
            resolver.registry().clear();
            return Ok(());
        }
        Some(origin) => origin,
    };

    let text = origin.fetch().await?;
    let resolver = resolver.clone();
    tokio::task::spawn_blocking(move || resolver.reload(&text)).await??;
    Ok(())
}

/// Log every known upstream with its current state.
pub fn report(resolver: &PacResolver) {
    let statuses = resolver.registry().snapshot();
    info!("Known proxies: {}", statuses.len());
    for (i, status) in statuses.iter().enumerate() {
        info!("{:3}. {}", i + 1, status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_reload_rereads_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"function FindProxyForURL(u, h) {{ return "DIRECT"; }}"#).unwrap();

        let resolver = Arc::new(PacResolver::new().unwrap());
        let source = PacSource::File(file.path().to_path_buf());
        let text = source.fetch().await.unwrap();
        resolver.load_from(&text, source).unwrap();

        let updated = r#"function FindProxyForURL(u, h) { return "PROXY updated.example:3128"; }"#;
        std::fs::write(file.path(), updated).unwrap();

        reload(&resolver).await.unwrap();
        assert_eq!(resolver.source(), updated);
        assert_eq!(
            resolver.resolve_verdict("http://a/", "a").unwrap(),
            "PROXY updated.example:3128"
        );
    }

    #[tokio::test]
    async fn test_reload_failure_keeps_script() {
        let file = NamedTempFile::new().unwrap();
        let source = PacSource::File(file.path().to_path_buf());

        let resolver = Arc::new(PacResolver::new().unwrap());
        resolver
            .load_from(r#"function FindProxyForURL(u, h) { return "DIRECT"; }"#, source)
            .unwrap();

        std::fs::write(file.path(), "function FindProxyForURL(u, h) {").unwrap();
        assert!(reload(&resolver).await.is_err());
        assert_eq!(resolver.resolve_verdict("http://a/", "a").unwrap(), "DIRECT");
    }

    #[tokio::test]
    async fn test_reload_without_origin_clears_status() {
        let resolver = Arc::new(PacResolver::new().unwrap());
        resolver.registry().probe("127.0.0.1:1");
        assert_eq!(resolver.registry().known_addresses().len(), 1);

        reload(&resolver).await.unwrap();
        assert!(resolver.registry().known_addresses().is_empty());
        report(&resolver);
    }
}

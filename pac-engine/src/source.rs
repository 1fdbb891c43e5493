//! Where PAC text comes from: inline, HTTP(S) URL or local file

use crate::error::{PacError, Result};
use std::fmt;
use std::path::PathBuf;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacSource {
    Inline(String),
    Url(Url),
    File(PathBuf),
}

impl PacSource {
    /// Guess what `thing` is.
    ///
    /// Text that defines `FindProxyForURL` is a script, an `http`/`https`
    /// URL is fetched, and anything else is treated as a path.
    pub fn detect(thing: &str) -> Self {
        if thing.contains("FindProxyForURL") && thing.contains('{') {
            return PacSource::Inline(thing.to_string());
        }

        if let Ok(url) = Url::parse(thing) {
            if matches!(url.scheme(), "http" | "https") {
                return PacSource::Url(url);
            }
        }

        PacSource::File(PathBuf::from(thing))
    }

    /// Load the script text.
    pub async fn fetch(&self) -> Result<String> {
        match self {
            PacSource::Inline(text) => {
                tracing::info!("loading PAC from inline text");
                Ok(text.clone())
            }
            PacSource::Url(url) => {
                tracing::info!(%url, "loading PAC from URL");
                let fetch_error = |source| PacError::SourceFetch {
                    url: url.to_string(),
                    source,
                };

                let response = reqwest::get(url.clone())
                    .await
                    .and_then(|r| r.error_for_status())
                    .map_err(fetch_error)?;
                response.text().await.map_err(fetch_error)
            }
            PacSource::File(path) => {
                tracing::info!(path = %path.display(), "loading PAC from file");
                tokio::fs::read_to_string(path)
                    .await
                    .map_err(|source| PacError::SourceLoad {
                        path: path.clone(),
                        source,
                    })
            }
        }
    }
}

impl fmt::Display for PacSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacSource::Inline(_) => write!(f, "inline script"),
            PacSource::Url(url) => write!(f, "{url}"),
            PacSource::File(path) => write!(f, "{}", path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SCRIPT: &str = "function FindProxyForURL(url, host) { return 'DIRECT'; }";

    #[test]
    fn test_detect_inline() {
        assert_eq!(
            PacSource::detect(SCRIPT),
            PacSource::Inline(SCRIPT.to_string())
        );
    }

    #[test]
    fn test_detect_url() {
        assert!(matches!(
            PacSource::detect("http://wpad.example.com/proxy.pac"),
            PacSource::Url(_)
        ));
        assert!(matches!(
            PacSource::detect("HTTPS://wpad.example.com/proxy.pac"),
            PacSource::Url(_)
        ));
    }

    #[test]
    fn test_detect_file() {
        assert_eq!(
            PacSource::detect("/etc/proxy.pac"),
            PacSource::File(PathBuf::from("/etc/proxy.pac"))
        );
        assert_eq!(
            PacSource::detect("proxy.pac"),
            PacSource::File(PathBuf::from("proxy.pac"))
        );
        // Only http and https are fetched
        assert!(matches!(
            PacSource::detect("ftp://example.com/proxy.pac"),
            PacSource::File(_)
        ));
    }

    #[tokio::test]
    async fn test_fetch_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(SCRIPT.as_bytes()).unwrap();

        let source = PacSource::File(file.path().to_path_buf());
        assert_eq!(source.fetch().await.unwrap(), SCRIPT);
    }

    #[tokio::test]
    async fn test_fetch_missing_file() {
        let source = PacSource::File(PathBuf::from("/nonexistent/proxy.pac"));
        assert!(matches!(
            source.fetch().await,
            Err(PacError::SourceLoad { .. })
        ));
    }

    #[tokio::test]
    async fn test_fetch_inline() {
        let source = PacSource::detect(SCRIPT);
        assert_eq!(source.fetch().await.unwrap(), SCRIPT);
    }
}

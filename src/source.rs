//! Byte sources a session can load: local files, URLs, or in-memory buffers

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

/// Failure to obtain the bytes of a source
#[derive(Error, Debug)]
pub enum SourceError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("Failed to fetch resource: HTTP {0}")]
    Status(reqwest::StatusCode),
}

/// Where the image bytes come from
#[derive(Clone, Debug)]
pub enum Source {
    File(PathBuf),
    Url(String),
    Bytes { name: String, data: Vec<u8> },
}

impl Source {
    /// Interpret a command line argument as a URL or a file path
    pub fn parse(arg: &str) -> Self {
        if arg.starts_with("http://") || arg.starts_with("https://") {
            Source::Url(arg.to_string())
        } else {
            Source::File(PathBuf::from(arg))
        }
    }

    pub fn bytes(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Source::Bytes {
            name: name.into(),
            data: data.into(),
        }
    }

    /// Short display name, used to name rendered output
    pub fn name(&self) -> String {
        match self {
            Source::File(path) => path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
            Source::Url(url) => url
                .split(['?', '#'])
                .next()
                .and_then(|u| u.rsplit('/').next())
                .unwrap_or_default()
                .to_string(),
            Source::Bytes { name, .. } => name.clone(),
        }
    }

    /// Read the whole source off the async executor
    pub(crate) async fn read(self) -> Result<LoadedSource, SourceError> {
        let name = self.name();
        let data = match self {
            Source::Bytes { data, .. } => data,
            Source::File(path) => {
                log::info!("Reading file: {:?}", path);
                smol::unblock(move || std::fs::read(path)).await?
            }
            Source::Url(url) => {
                log::info!("Downloading from URL: {}", url);
                smol::unblock(move || {
                    let response = reqwest::blocking::get(&url)?;
                    if !response.status().is_success() {
                        return Err(SourceError::Status(response.status()));
                    }
                    Ok::<Vec<u8>, SourceError>(response.bytes()?.to_vec())
                })
                .await?
            }
        };

        Ok(LoadedSource {
            name,
            data: data.into(),
        })
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::File(path) => write!(f, "{}", path.display()),
            Source::Url(url) => f.write_str(url),
            Source::Bytes { name, data } => write!(f, "{} ({} bytes in memory)", name, data.len()),
        }
    }
}

/// The full bytes of a loaded source, shared with in-flight decode calls
#[derive(Clone)]
pub(crate) struct LoadedSource {
    pub name: String,
    pub data: Arc<[u8]>,
}

impl LoadedSource {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn output_name(&self) -> String {
        if self.name.is_empty() {
            "rendered.png".to_string()
        } else {
            format!("{}.rendered.png", self.name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_distinguishes_urls() {
        assert!(matches!(Source::parse("https://example.com/a.jxl"), Source::Url(_)));
        assert!(matches!(Source::parse("images/a.jxl"), Source::File(_)));
    }

    #[test]
    fn test_names() {
        assert_eq!(Source::parse("dir/tree.jxl").name(), "tree.jxl");
        assert_eq!(Source::parse("https://example.com/img/sunset.jxl?x=1").name(), "sunset.jxl");
        assert_eq!(Source::parse("https://example.com/").name(), "");
        assert_eq!(Source::bytes("logo.jxl", vec![1, 2]).name(), "logo.jxl");
    }

    #[test]
    fn test_output_name() {
        let named = LoadedSource {
            name: "tree.jxl".into(),
            data: Arc::from(Vec::new()),
        };
        assert_eq!(named.output_name(), "tree.jxl.rendered.png");

        let nameless = LoadedSource {
            name: String::new(),
            data: Arc::from(Vec::new()),
        };
        assert_eq!(nameless.output_name(), "rendered.png");
    }

    #[test]
    fn test_read_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[7u8; 42]).unwrap();

        let loaded = smol::block_on(Source::File(file.path().to_path_buf()).read()).unwrap();
        assert_eq!(loaded.len(), 42);
    }

    #[test]
    fn test_read_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = smol::block_on(Source::File(dir.path().join("missing.jxl")).read());
        assert!(matches!(result, Err(SourceError::Io(_))));
    }
}

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("bucket capacity must be greater than zero")]
    ZeroCapacity,

    #[error("refill rate must be greater than zero")]
    ZeroRate,

    #[error("refill interval must be greater than zero")]
    ZeroInterval,

    #[error("unable to start refill thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("unable to read config {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_share_lowercase_style() {
        let errors = [
            Error::ZeroCapacity,
            Error::ZeroRate,
            Error::ZeroInterval,
            Error::Spawn(std::io::Error::new(std::io::ErrorKind::Other, "no threads")),
        ];
        for err in errors {
            let msg = err.to_string();
            assert!(msg.starts_with(char::is_lowercase), "{msg}");
        }
        assert_eq!(
            Error::Spawn(std::io::Error::new(std::io::ErrorKind::Other, "no threads")).to_string(),
            "unable to start refill thread: no threads"
        );
    }
}

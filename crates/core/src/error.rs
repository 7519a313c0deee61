use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("unexpected status {status} from {url}: {body}")]
    Status {
        status: u16,
        url: String,
        body: String,
    },

    #[error("decode error: {0}")]
    Decode(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("expression error: {0}")]
    Expression(String),

    #[error("no metrics configured")]
    NoMetrics,

    #[error("unknown datasource: {0}")]
    UnknownDatasource(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ScrapeError>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A diagnostic of the fatal tier.  The full context has already been
    /// written to the error sink by the reporter; this value only carries
    /// the one-line summary up to the driver.
    #[error("{0}")]
    Fatal(String),
    #[error("Error processing io: {0}")]
    Io(#[from] std::io::Error),
    /// Recoverable errors were reported while lexing; the run as a whole
    /// still fails.
    #[error("{0} error(s) in input")]
    Failed(usize),
}

pub type Result<T> = std::result::Result<T, Error>;

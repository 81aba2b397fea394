use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    /// No schedulable account matched the request after exclusions.
    #[error("no available account for model {model}")]
    NoAccount { model: String },
}

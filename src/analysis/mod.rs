pub mod cointegration;
pub mod prices;
pub mod zscore;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AnalysisError {
    #[error("price series has an undefined close at index {index}")]
    DataGap { index: usize },
    #[error("price series incomplete: expected {expected} closes, got {got}")]
    Incomplete { expected: usize, got: usize },
    #[error("series lengths differ ({left} vs {right})")]
    LengthMismatch { left: usize, right: usize },
    #[error("need at least {needed} observations, got {got}")]
    InsufficientData { needed: usize, got: usize },
    #[error("degenerate fit: {0}")]
    DegenerateFit(String),
}

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PhaseError {
    #[error("invalid grid: {0}")]
    InvalidGrid(String),

    #[error("shape mismatch for {what}: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("solve set is empty: mask has no cells inside the outer ring")]
    EmptyDomain,

    #[error("solve set splits into {components} disconnected regions")]
    DisconnectedDomain { components: usize },

    #[error("linear system is singular: {0}")]
    SingularSystem(String),

    #[error("validity set is empty after erosion by rim={rim}")]
    EmptyValidity { rim: usize },

    #[error("plane fit is degenerate: fewer than three non-collinear valid cells")]
    DegenerateFit,

    #[error("undefined {what} value inside the domain at row={row}, col={col}")]
    UndefinedInDomain {
        what: &'static str,
        row: usize,
        col: usize,
    },

    #[error("configuration error: {0}")]
    Config(String),
}

pub type PhaseResult<T> = Result<T, PhaseError>;

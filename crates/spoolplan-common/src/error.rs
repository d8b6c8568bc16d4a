use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures raised by the spool planning passes.
///
/// Graph-shaped errors (`CyclicPlan`, `DanglingNode`) mean the supplied plan
/// is malformed; callers should fall back to the unoptimized plan rather
/// than abort query compilation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    CyclicPlan(String),
    DanglingNode(String),
    EmptyPlan,
    SchemaMismatch(String),
    Internal(String),
}

impl Error {
    pub fn cyclic_plan(msg: impl Into<String>) -> Self {
        Error::CyclicPlan(msg.into())
    }

    pub fn dangling_node(msg: impl Into<String>) -> Self {
        Error::DanglingNode(msg.into())
    }

    pub fn schema_mismatch(msg: impl Into<String>) -> Self {
        Error::SchemaMismatch(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::CyclicPlan(msg) => write!(f, "Cyclic plan: {}", msg),
            Error::DanglingNode(msg) => write!(f, "Dangling node reference: {}", msg),
            Error::EmptyPlan => write!(f, "Empty plan"),
            Error::SchemaMismatch(msg) => write!(f, "Schema mismatch: {}", msg),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_constructors() {
        let e = Error::cyclic_plan("n3 reaches itself");
        assert!(matches!(e, Error::CyclicPlan(_)));

        let e = Error::dangling_node("n7 not in arena");
        assert!(matches!(e, Error::DanglingNode(_)));

        let e = Error::schema_mismatch("spool read schema differs");
        assert!(matches!(e, Error::SchemaMismatch(_)));

        let e = Error::internal("unreachable state");
        assert!(matches!(e, Error::Internal(_)));
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            format!("{}", Error::CyclicPlan("test".to_string())),
            "Cyclic plan: test"
        );
        assert_eq!(
            format!("{}", Error::DanglingNode("test".to_string())),
            "Dangling node reference: test"
        );
        assert_eq!(format!("{}", Error::EmptyPlan), "Empty plan");
        assert_eq!(
            format!("{}", Error::SchemaMismatch("test".to_string())),
            "Schema mismatch: test"
        );
        assert_eq!(
            format!("{}", Error::Internal("test".to_string())),
            "Internal error: test"
        );
    }

    #[test]
    fn test_error_is_std_error() {
        let e: Box<dyn std::error::Error> = Box::new(Error::EmptyPlan);
        assert_eq!(e.to_string(), "Empty plan");
    }
}

use crate::value::ValueKind;

/// Errors surfaced by value coercion, property dispatch and storage growth.
///
/// Invariant violations (double frees, list corruption, marking a kind with
/// no override) are not represented here: they are debug-asserted and degrade
/// fail-safe in release builds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// A coercion or property definition was attempted against an
    /// incompatible kind. Raised at the call site, never deferred.
    TypeMismatch {
        expected: &'static str,
        got: ValueKind,
    },
    /// A weak reference (or generation-checked handle) was dereferenced after
    /// its target was freed. Benign: the plain lookup surface reports the
    /// same condition as an absent result.
    StaleReference,
    /// Sparse-map growth or handle-size tracking hit an implementation limit.
    CapacityExceeded {
        what: &'static str,
        limit: usize,
    },
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeError::TypeMismatch { expected, got } => {
                write!(f, "type mismatch: expected {expected}, got {got}")
            }
            RuntimeError::StaleReference => {
                write!(f, "stale reference: target has been freed")
            }
            RuntimeError::CapacityExceeded { what, limit } => {
                write!(f, "capacity exceeded: {what} limited to {limit}")
            }
        }
    }
}

impl std::error::Error for RuntimeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_offending_kind() {
        let err = RuntimeError::TypeMismatch {
            expected: "real, int32, int64 or bool",
            got: ValueKind::Str,
        };
        let text = err.to_string();
        assert!(text.contains("expected real, int32, int64 or bool"));
        assert!(text.contains("string"));
    }

    #[test]
    fn display_capacity_includes_limit() {
        let err = RuntimeError::CapacityExceeded {
            what: "sparse map",
            limit: 1 << 30,
        };
        assert!(err.to_string().contains(&(1usize << 30).to_string()));
    }
}

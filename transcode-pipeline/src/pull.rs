//! Three-outcome pull results.

/// Result of pulling from a stage that may buffer internally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pull<T> {
    /// An output item is available.
    Value(T),
    /// Nothing is available until more input is submitted.
    NotReady,
    /// The stage has been flushed and fully drained.
    Finished,
}

impl<T> Pull<T> {
    /// Take the value, if any.
    pub fn value(self) -> Option<T> {
        match self {
            Pull::Value(v) => Some(v),
            _ => None,
        }
    }

    /// Check whether the stage reported end of output.
    pub fn is_finished(&self) -> bool {
        matches!(self, Pull::Finished)
    }

    /// Map the carried value.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Pull<U> {
        match self {
            Pull::Value(v) => Pull::Value(f(v)),
            Pull::NotReady => Pull::NotReady,
            Pull::Finished => Pull::Finished,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pull_helpers() {
        assert_eq!(Pull::Value(2).map(|v| v * 2).value(), Some(4));
        assert_eq!(Pull::<u8>::NotReady.value(), None);
        assert!(Pull::<u8>::Finished.is_finished());
        assert!(!Pull::<u8>::NotReady.is_finished());
    }
}

//! Processing stages wrapping codecs and filter graphs.
//!
//! Every stage accepts input with `submit` and hands out its buffered
//! output through a [`Drain`] iterator, which ends as soon as the stage has
//! nothing more to give for now. Flushing a stage signals end of input and
//! drains everything it was holding back.

mod decode;
mod encode;
mod filter;

use crate::error::Result;
use crate::pull::Pull;

pub use decode::DecodeStage;
pub use encode::EncodeStage;
pub use filter::FilterStage;

/// A stage that output can be pulled from.
pub trait PullSource {
    /// Unit of output.
    type Item;

    /// Pull the next output unit.
    fn pull_next(&mut self) -> Result<Pull<Self::Item>>;
}

/// Lazy iterator over a stage's currently available output.
///
/// Yields `Ok` items until the stage reports not-ready or finished. An
/// error is yielded once and ends the iteration.
pub struct Drain<'a, S: PullSource + ?Sized> {
    source: &'a mut S,
    done: bool,
}

impl<'a, S: PullSource + ?Sized> Drain<'a, S> {
    pub(crate) fn new(source: &'a mut S) -> Self {
        Self {
            source,
            done: false,
        }
    }
}

impl<S: PullSource + ?Sized> Iterator for Drain<'_, S> {
    type Item = Result<S::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.source.pull_next() {
            Ok(Pull::Value(item)) => Some(Ok(item)),
            Ok(Pull::NotReady) | Ok(Pull::Finished) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;

    struct Counter {
        remaining: u32,
        fail_at: Option<u32>,
    }

    impl PullSource for Counter {
        type Item = u32;

        fn pull_next(&mut self) -> Result<Pull<u32>> {
            if Some(self.remaining) == self.fail_at {
                self.fail_at = None;
                return Err(PipelineError::Decode {
                    stream: 0,
                    reason: "bad".into(),
                });
            }
            if self.remaining == 0 {
                return Ok(Pull::NotReady);
            }
            self.remaining -= 1;
            Ok(Pull::Value(self.remaining))
        }
    }

    #[test]
    fn test_drain_until_not_ready() {
        let mut source = Counter {
            remaining: 3,
            fail_at: None,
        };
        let items: Vec<u32> = Drain::new(&mut source).map(|r| r.unwrap()).collect();
        assert_eq!(items, vec![2, 1, 0]);
        assert_eq!(Drain::new(&mut source).count(), 0);
    }

    #[test]
    fn test_drain_stops_after_error() {
        let mut source = Counter {
            remaining: 3,
            fail_at: Some(1),
        };
        let results: Vec<_> = Drain::new(&mut source).collect();
        assert_eq!(results.len(), 3);
        assert!(results[2].is_err());
        assert_eq!(Drain::new(&mut source).count(), 1);
    }
}

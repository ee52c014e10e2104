//! Settled outcomes of one batch execution.

use std::fmt;

use crate::Error;

/// Partition of a batch's outcomes into successes and failures.
///
/// Produced once per execution and afterwards only merged through
/// [`BatchResult::combine`]; nothing is ever dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchResult<T, E = Error> {
    pub results: Vec<T>,
    pub errors: Vec<E>,
}

impl<T, E> Default for BatchResult<T, E> {
    fn default() -> Self {
        Self {
            results: Vec::new(),
            errors: Vec::new(),
        }
    }
}

impl<T, E> BatchResult<T, E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Partition settled outcomes, keeping submission order within each side.
    pub fn from_outcomes(outcomes: impl IntoIterator<Item = std::result::Result<T, E>>) -> Self {
        let mut batch = Self::new();
        for outcome in outcomes {
            batch.push(outcome);
        }
        batch
    }

    pub(crate) fn push(&mut self, outcome: std::result::Result<T, E>) {
        match outcome {
            Ok(value) => self.results.push(value),
            Err(err) => self.errors.push(err),
        }
    }

    pub fn len(&self) -> usize {
        self.results.len() + self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Merge another batch after this one.
    pub fn combine(mut self, other: Self) -> Self {
        self.results.extend(other.results);
        self.errors.extend(other.errors);
        self
    }

    pub fn combine_all(batches: impl IntoIterator<Item = Self>) -> Self {
        batches.into_iter().fold(Self::new(), Self::combine)
    }

    /// Successes if nothing failed, otherwise one error carrying both sides.
    pub fn raise_errors(self) -> std::result::Result<Vec<T>, BatchError<T, E>> {
        if self.errors.is_empty() {
            Ok(self.results)
        } else {
            Err(BatchError {
                results: self.results,
                errors: self.errors,
            })
        }
    }
}

/// Every success alongside every failure of a batch that did not fully succeed.
#[derive(Debug)]
pub struct BatchError<T, E = Error> {
    pub results: Vec<T>,
    pub errors: Vec<E>,
}

impl<T, E: fmt::Display> fmt::Display for BatchError<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} operations failed",
            self.errors.len(),
            self.errors.len() + self.results.len()
        )?;
        for err in &self.errors {
            write!(f, "; {}", err)?;
        }
        Ok(())
    }
}

impl<T: fmt::Debug, E: fmt::Debug + fmt::Display> std::error::Error for BatchError<T, E> {}

impl<T: fmt::Display> From<BatchError<T, Error>> for Error {
    fn from(err: BatchError<T, Error>) -> Self {
        Error::Aggregate {
            succeeded: err.results.iter().map(|r| r.to_string()).collect(),
            failures: err.errors,
        }
    }
}

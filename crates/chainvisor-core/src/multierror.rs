//! Aggregation of independent failures into one error value.
//!
//! Teardown and configuration validation both produce several unrelated
//! errors at once. [`flatten_errors`] folds them into a single value without
//! losing any of them and without nesting one aggregate inside another.

use std::fmt;
use std::sync::Arc;

/// A cloneable, thread-safe error handle.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Several errors reported together, in the order they occurred.
#[derive(Debug, Clone)]
pub struct MultiError {
    errors: Vec<SharedError>,
}

impl MultiError {
    /// A copy of the contained errors. Changing the returned vector does not
    /// affect this value.
    pub fn errors(&self) -> Vec<SharedError> {
        self.errors.clone()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors: ", self.errors.len())?;
        for (i, e) in self.errors.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}: {e}", i + 1)?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}

/// Collapse a list of optional errors.
///
/// `None` entries are dropped. Members of a nested [`MultiError`] are spliced
/// in place. Returns `None` when nothing is left, the lone error itself (the
/// same `Arc`) when exactly one is left, and a [`MultiError`] otherwise.
pub fn flatten_errors<I>(errs: I) -> Option<SharedError>
where
    I: IntoIterator<Item = Option<SharedError>>,
{
    let mut flat: Vec<SharedError> = Vec::new();
    for err in errs.into_iter().flatten() {
        match err.downcast_ref::<MultiError>() {
            Some(multi) => flat.extend(multi.errors.iter().cloned()),
            None => flat.push(err),
        }
    }
    match flat.len() {
        0 => None,
        1 => flat.pop(),
        _ => Some(Arc::new(MultiError { errors: flat })),
    }
}

/// Wrap any error into a [`SharedError`].
pub fn shared<E>(err: E) -> SharedError
where
    E: std::error::Error + Send + Sync + 'static,
{
    Arc::new(err)
}

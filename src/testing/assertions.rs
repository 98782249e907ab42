//! Assertion functions for cloud operation results.

use crate::traits::{CloudResult, ErrorKind};
use std::fmt::Debug;

/// Assert that an operation failed with the given error kind.
///
/// # Panics
///
/// Panics if the result is `Ok` or carries a different kind.
///
/// # Example
///
/// ```
/// use cloudsim::testing::assert_error_kind;
/// use cloudsim::{CloudError, CloudResult, ErrorKind};
///
/// let result: CloudResult<()> = Err(CloudError::conflict("bucket not empty"));
/// assert_error_kind(&result, ErrorKind::Conflict);
/// ```
pub fn assert_error_kind<T: Debug>(result: &CloudResult<T>, expected: ErrorKind) {
    match result {
        Ok(value) => panic!("Expected {expected:?} error, got Ok({value:?})"),
        Err(err) => assert_eq!(
            err.kind, expected,
            "Error kind mismatch:\n  Expected: {expected:?}\n  Actual: {:?}\n  Message: {}",
            err.kind, err.message
        ),
    }
}

/// Assert that a listing returned exactly the given names, in order.
///
/// # Panics
///
/// Panics if the listing failed or differs.
pub fn assert_names(actual: &CloudResult<Vec<String>>, expected: &[&str]) {
    let names = match actual {
        Ok(names) => names,
        Err(err) => panic!("Listing failed: {err}"),
    };
    let names: Vec<&str> = names.iter().map(String::as_str).collect();
    assert_eq!(
        names, expected,
        "Listing mismatch:\n  Expected: {expected:?}\n  Actual: {names:?}"
    );
}

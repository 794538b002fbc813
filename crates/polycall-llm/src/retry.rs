//! Re-prompting after extraction validation failures.

use std::future::Future;

use polycall_types::{FieldError, Result};

// ---------------------------------------------------------------------------
// Error reinsertion
// ---------------------------------------------------------------------------

/// Call `f` up to `max_attempts` times while it fails extraction validation.
///
/// Each attempt receives every validation error seen so far, so the prompt
/// can show the model what it got wrong. Errors other than
/// [`polycall_types::PolycallError::ExtractionValidation`] propagate immediately; when the
/// attempts run out the last validation error is returned.
pub fn with_error_reinsertion<T, F>(max_attempts: usize, mut f: F) -> Result<T>
where
    F: FnMut(&[FieldError]) -> Result<T>,
{
    let mut seen: Vec<FieldError> = Vec::new();
    let mut attempt = 1;
    loop {
        match f(&seen) {
            Err(e) if e.is_validation() && attempt < max_attempts => {
                tracing::debug!(attempt, errors = e.field_errors().len(), "extraction invalid, re-prompting");
                seen.extend_from_slice(e.field_errors());
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// Async form of [`with_error_reinsertion`]. The errors are handed over by
/// value so the returned future can own them.
pub async fn with_error_reinsertion_async<T, F, Fut>(max_attempts: usize, mut f: F) -> Result<T>
where
    F: FnMut(Vec<FieldError>) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut seen: Vec<FieldError> = Vec::new();
    let mut attempt = 1;
    loop {
        match f(seen.clone()).await {
            Err(e) if e.is_validation() && attempt < max_attempts => {
                tracing::debug!(attempt, errors = e.field_errors().len(), "extraction invalid, re-prompting");
                seen.extend_from_slice(e.field_errors());
                attempt += 1;
            }
            other => return other,
        }
    }
}

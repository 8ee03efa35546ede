/// Retry macros for exception-driven progressive loading.
///
/// Synchronous parsing code raises `DataMissing { position, length }` when it
/// touches a byte that has not arrived yet. The caller awaits
/// `ensure_range(position, position + length)` on the loader and runs the
/// operation again. Both macros must be used inside an `async` context.

/// Retries an operation until it stops failing with `DataMissing`, up to
/// [`DEFAULT_MAX_RETRIES`](crate::core::config::DEFAULT_MAX_RETRIES) times.
///
/// # Example
/// ```ignore
/// let trailer = retry_on_data_missing!(manager, {
///     let mut stream = manager.stream();
///     find_startxref(&mut stream)
/// })?;
/// ```
#[macro_export]
macro_rules! retry_on_data_missing {
    ($manager:expr, $operation:expr) => {
        $crate::retry_on_data_missing_with_limit!(
            $manager,
            $crate::core::config::DEFAULT_MAX_RETRIES,
            $operation
        )
    };
}

/// Retries an operation with a custom retry limit.
///
/// `ensure_range` failures (transport errors, cancellation) are returned
/// as-is; only `DataMissing` triggers another attempt.
#[macro_export]
macro_rules! retry_on_data_missing_with_limit {
    ($manager:expr, $max_retries:expr, $operation:expr) => {{
        let mut retries = 0usize;

        loop {
            match $operation {
                Ok(result) => break Ok(result),
                Err($crate::core::error::PDFError::DataMissing { position, length }) => {
                    retries += 1;
                    if retries > $max_retries {
                        break Err($crate::core::error::PDFError::Generic(format!(
                            "Exceeded maximum retries ({}) while loading data at position {} (length {})",
                            $max_retries, position, length
                        )));
                    }

                    let end = position.saturating_add(length.max(1));
                    if let Err(e) = $manager.ensure_range(position, end).await {
                        break Err(e);
                    }
                }
                Err(e) => break Err(e),
            }
        }
    }};
}

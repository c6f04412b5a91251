//! User-facing diagnostics: errors that know how to explain
//! themselves.

/// An error that can offer hints on how to resolve it.
pub trait DiagnosableError: std::error::Error {
    fn diagnose(&self) -> Vec<String> {
        vec![]
    }
}

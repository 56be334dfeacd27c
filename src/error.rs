//! Shared error utilities used across the compilation pipeline.
//!
//! Diagnostics are kept lightweight on purpose – these routines format
//! messages in a style reminiscent of chibicc: the offending source line
//! followed by a caret run underlining the bad lexeme.

use snafu::Snafu;

pub type CompileResult<T> = Result<T, CompileError>;

#[derive(Debug, Snafu)]
pub enum CompileError {
  #[snafu(display("{source_line}\n{marker} {message}"))]
  WithLocation {
    source_line: String,
    marker: String,
    message: String,
  },
}

impl CompileError {
  /// Construct an error anchored at a specific byte offset in the source.
  pub fn at(source: &str, loc: usize, message: impl Into<String>) -> Self {
    Self::at_span(source, loc, 1, message)
  }

  /// Construct an error underlining `len` bytes starting at `loc`.
  pub fn at_span(source: &str, loc: usize, len: usize, message: impl Into<String>) -> Self {
    let safe_loc = loc.min(source.len());
    let pad = source[..safe_loc].chars().count();
    Self::WithLocation {
      source_line: source.to_string(),
      marker: format!("{}{}", " ".repeat(pad), "^".repeat(len.max(1))),
      message: message.into(),
    }
  }
}

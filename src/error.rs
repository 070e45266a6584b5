//! Error type for the CMUX DTE core.
//!
//! Transient, recoverable conditions (bad trailing SOF, a missed pattern-pop,
//! a UART FIFO overflow) are never represented here. Per the error-handling
//! design they are logged and handled in place by the reader thread and never
//! surface to a caller as a `Result::Err`. This enum covers only the failures
//! a caller-facing operation (init, send, mode change) can report.

use std::time::Duration;

use crate::mode::Mode;

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// DTE-facing error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
	/// The UART driver could not be configured or installed at init.
	#[error("uart init failed: {0}")]
	UartInit(#[source] std::io::Error),

	/// `change_mode` was called with the mode the DTE is already in.
	#[error("already in mode {0:?}")]
	AlreadyInMode(Mode),

	/// A rendezvous wait (send_cmd / send_cmux_cmd / send_sabm) expired.
	#[error("command timed out after {0:?}")]
	Timeout(Duration),

	/// A write to the UART failed.
	#[error("uart write failed: {0}")]
	Write(#[source] std::io::Error),

	/// A read from the UART failed (used by `send_wait`).
	#[error("uart read failed: {0}")]
	Read(#[source] std::io::Error),

	/// `send_wait` read back a prompt that did not match what was expected.
	#[error("prompt mismatch: expected {expected:?}, got {got:?}")]
	PromptMismatch { expected: Vec<u8>, got: Vec<u8> },

	/// A UIH payload exceeded the 127-byte single-byte-length encoding.
	#[error("payload too large for a single-byte-length CMUX frame: {0} bytes")]
	PayloadTooLarge(usize),

	/// The reader thread for this DTE is no longer running.
	#[error("reader task is not running")]
	ReaderGone,
}

//! DTE configuration: UART parameters plus the handful of behaviors the
//! original firmware left as silent constants and this crate makes
//! explicit, configurable decisions (see `DESIGN.md` for the open-question
//! writeups behind `cmux_line_offset` and `is_dial_command`).

use std::time::Duration;

/// Serial line parity setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
	None,
	Even,
	Odd,
}

/// Serial line flow-control setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControl {
	None,
	Hardware,
}

/// Configuration for a [`crate::dte::Dte`] instance.
///
/// UART electrical parameters (`baud_rate`, `data_bits`, ...) are plumbed
/// straight through to whatever [`crate::uart::UartPort`] implementation is
/// bound; this crate itself only inspects the buffer-sizing and
/// behavioral-choice fields.
#[derive(Debug, Clone)]
pub struct DteConfig {
	pub baud_rate: u32,
	pub data_bits: u8,
	pub parity: Parity,
	pub stop_bits: u8,
	pub flow_control: FlowControl,

	/// Capacity of the CMUX/PPP reassembly buffer. The recommended
	/// minimum is 16 KiB; below that, large UIH bursts can overrun the
	/// buffer before the reader drains it.
	pub rx_buffer_size: usize,
	/// Capacity of a single outbound write.
	pub tx_buffer_size: usize,
	/// Capacity of the UART event queue delivered to the reader thread.
	pub event_queue_size: usize,
	/// Capacity of the Command-mode line-assembly buffer.
	pub line_buffer_size: usize,
	/// Capacity of the pattern-position queue (Command mode `\n` offsets).
	pub pattern_queue_size: usize,

	/// How long a blocking send waits for its rendezvous before returning
	/// [`crate::error::Error::Timeout`].
	pub command_timeout: Duration,

	/// How many leading bytes of a DLCI 1/2 CMUX frame's payload are a CRLF
	/// prefix the modem prepends and this crate strips before treating the
	/// rest as response text. Resolves an open question: the original hard
	/// codes this skip at 2 bytes; exposing it lets a caller adapt to a
	/// modem that doesn't prepend CRLF without touching dispatch logic.
	/// Default `2`.
	pub cmux_line_offset: usize,

	/// Classifies an AT command string as a dial command, which routes its
	/// response wait to DLCI 1 instead of DLCI 2 once CMUX is active.
	/// Generalizes a literal, single-string comparison (`ATD*99***1#\r`)
	/// into a predicate so a caller dialing a different APN context or
	/// using a different dial string still gets correct routing. The
	/// default matches exactly the original literal.
	pub is_dial_command: fn(&str) -> bool,
}

fn default_is_dial_command(cmd: &str) -> bool {
	cmd == "ATD*99***1#\r"
}

impl Default for DteConfig {
	fn default() -> Self {
		Self {
			baud_rate: 115_200,
			data_bits: 8,
			parity: Parity::None,
			stop_bits: 1,
			flow_control: FlowControl::Hardware,
			rx_buffer_size: 16 * 1024,
			tx_buffer_size: 2 * 1024,
			event_queue_size: 32,
			line_buffer_size: 256,
			pattern_queue_size: 16,
			command_timeout: Duration::from_secs(5),
			cmux_line_offset: 2,
			is_dial_command: default_is_dial_command,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_dial_command_matches_the_canonical_dial_string_only() {
		let cfg = DteConfig::default();
		assert!((cfg.is_dial_command)("ATD*99***1#\r"));
		assert!(!(cfg.is_dial_command)("ATD*99***2#\r"));
		assert!(!(cfg.is_dial_command)("AT+CFUN?\r"));
	}
}

//! Mode controller: the Command / CMUX / PPP state machine.
//!
//! Transitions reconfigure the UART's reception discipline and notify the
//! bound DCE; they never touch the reassembly buffer directly (that is the
//! reader thread's job). `X -> X` transitions are rejected; the caller must
//! already know what mode it's in.

use std::fmt;

use crate::dce::Dce;
use crate::error::{Error, Result};
use crate::uart::UartPort;

/// Driver operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
	/// Plain, unmultiplexed AT mode: lines terminated by `\n`.
	Command,
	/// 3GPP TS 27.010 CMUX multiplexing is active.
	Cmux,
	/// Raw PPP/IP bytes are flowing on the data channel.
	Ppp,
}

impl fmt::Display for Mode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Mode::Command => write!(f, "Command"),
			Mode::Cmux => write!(f, "CMUX"),
			Mode::Ppp => write!(f, "PPP"),
		}
	}
}

/// Drives mode transitions against a UART port and a bound DCE.
///
/// This type owns no state of its own beyond the current [`Mode`] (the
/// reassembly buffer and rendezvous live on [`crate::dte::Dte`]). It exists
/// as a separate unit so the mode transition table has exactly one
/// implementation site.
pub struct ModeController {
	mode: Mode,
}

impl ModeController {
	/// Creates a controller starting in Command mode (the DTE always comes
	/// up in Command mode after the init-time CMUX close-down sequence).
	pub fn new() -> Self {
		Self { mode: Mode::Command }
	}

	/// The mode the controller currently believes it is in.
	pub fn current(&self) -> Mode {
		self.mode
	}

	/// Executes the Command/CMUX/PPP mode transition table.
	///
	/// Rejects `new_mode == self.current()` with [`Error::AlreadyInMode`].
	pub fn change_mode(
		&mut self,
		new_mode: Mode,
		uart: &mut dyn UartPort,
		dce: &dyn Dce,
	) -> Result<()> {
		if new_mode == self.mode {
			return Err(Error::AlreadyInMode(new_mode));
		}

		match (self.mode, new_mode) {
			(Mode::Command, Mode::Ppp) => {
				dce.set_working_mode(Mode::Ppp);
				uart.disable_pattern_detection()
					.map_err(Error::UartInit)?;
				uart.enable_rx_interrupt().map_err(Error::UartInit)?;
			}
			(Mode::Command, Mode::Cmux) => {
				dce.set_working_mode(Mode::Cmux);
				uart.disable_pattern_detection()
					.map_err(Error::UartInit)?;
				uart.enable_rx_interrupt().map_err(Error::UartInit)?;
				dce.setup_cmux();
			}
			(Mode::Ppp, Mode::Command) | (Mode::Cmux, Mode::Command) => {
				uart.disable_rx_interrupt().map_err(Error::UartInit)?;
				uart.flush_input().map_err(Error::UartInit)?;
				uart.enable_pattern_detection(b'\n')
					.map_err(Error::UartInit)?;
				dce.set_working_mode(Mode::Command);
			}
			// Any other pairing (Ppp<->Cmux directly, or anything not named
			// in the transition table) is not a legal transition either;
			// treat it the same as the X -> X case rather than silently
			// reconfiguring the UART in an unspecified way.
			_ => return Err(Error::AlreadyInMode(new_mode)),
		}

		self.mode = new_mode;
		Ok(())
	}
}

impl Default for ModeController {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::dce::NullDce;
	use crate::uart::LoopbackUart;

	#[test]
	fn rejects_transition_to_current_mode() {
		let mut mc = ModeController::new();
		let mut uart = LoopbackUart::new(4096);
		let dce = NullDce::new();
		let err = mc.change_mode(Mode::Command, &mut uart, &dce).unwrap_err();
		assert!(matches!(err, Error::AlreadyInMode(Mode::Command)));
	}

	#[test]
	fn command_to_cmux_calls_setup_cmux_and_disables_pattern_detection() {
		let mut mc = ModeController::new();
		let mut uart = LoopbackUart::new(4096);
		uart.enable_pattern_detection(b'\n').unwrap();
		let dce = NullDce::new();
		mc.change_mode(Mode::Cmux, &mut uart, &dce).unwrap();
		assert_eq!(mc.current(), Mode::Cmux);
		assert!(!uart.pattern_detection_enabled());
		assert_eq!(dce.setup_cmux_calls(), 1);
		assert_eq!(dce.working_mode(), Some(Mode::Cmux));
	}

	#[test]
	fn cmux_to_command_reenables_pattern_detection_and_flushes() {
		let mut mc = ModeController::new();
		let mut uart = LoopbackUart::new(4096);
		let dce = NullDce::new();
		mc.change_mode(Mode::Cmux, &mut uart, &dce).unwrap();
		mc.change_mode(Mode::Command, &mut uart, &dce).unwrap();
		assert_eq!(mc.current(), Mode::Command);
		assert!(uart.pattern_detection_enabled());
		assert_eq!(dce.working_mode(), Some(Mode::Command));
	}
}

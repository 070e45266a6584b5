//! DTE-side core of a 3GPP TS 27.010 CMUX serial-link modem driver.
//!
//! This crate owns the Command / CMUX / PPP mode state machine, the CMUX
//! framer/deframer, the single reader thread that drains a UART event queue,
//! and the blocking send surface ([`Dte::send_cmd`], [`Dte::send_cmux_cmd`],
//! [`Dte::send_sabm`], [`Dte::send_wait`]) a caller uses to drive a modem.
//! It does not implement a modem's AT-command semantics or PDP/IP handling;
//! that is the [`Dce`] trait's job, supplied by the caller.
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use cmux_dte::{Dce, DteConfig, Dte, NullDce};
//! # #[cfg(feature = "serialport-backend")]
//! # fn example() -> cmux_dte::Result<()> {
//! use cmux_dte::uart::serialport_backend::SerialPortUart;
//!
//! let uart = SerialPortUart::open("/dev/ttyUSB2", 115_200)?;
//! let dte = Dte::new(Box::new(uart), Arc::new(NullDce::new()), DteConfig::default())?;
//! let response = dte.send_cmd("AT\r", Duration::from_secs(2))?;
//! println!("{response}");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod crc;
pub mod dce;
pub mod dte;
pub mod error;
pub mod event;
pub mod frame;
pub mod mode;
pub mod reader;
pub mod rendezvous;
pub mod uart;

pub use config::{DteConfig, FlowControl, Parity};
pub use dce::{Dce, NullDce, PendingRequest};
pub use dte::Dte;
pub use error::{Error, Result};
pub use event::{EventKind, EventPayload, EventSink};
pub use frame::{Deframer, Frame, FrameType};
pub use mode::{Mode, ModeController};
pub use rendezvous::Rendezvous;
pub use uart::{LoopbackUart, UartEvent, UartPort};

/// Test-only helpers shared across this crate's `#[cfg(test)]` modules.
#[cfg(test)]
pub(crate) mod test_support {
	/// Installs a `tracing` subscriber that prints to the test harness's
	/// captured output, so `tracing::warn!` calls on resync/overflow paths
	/// are visible with `cargo test -- --nocapture`. Safe to call from every
	/// test; only the first call in a process wins.
	pub(crate) fn init_tracing() {
		let _ = tracing_subscriber::fmt().with_test_writer().try_init();
	}
}

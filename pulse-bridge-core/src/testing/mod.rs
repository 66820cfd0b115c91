//! In-process stand-ins for the native libraries.
//!
//! [`FakePulse`] runs a real event thread per mainloop and scripts the
//! server side of the protocol; [`FakeSimple`] records blocking stream I/O.
//! Both count calls and live objects so tests can assert on resource
//! ownership.

mod fake_pulse;
mod fake_simple;

pub use fake_pulse::{CallCounts, FakePulse};
pub use fake_simple::FakeSimple;

pub const ERR_ACCESS: i32 = 1;
pub const ERR_CONNECTION_REFUSED: i32 = 6;
pub const ERR_TIMEOUT: i32 = 8;
pub const ERR_BAD_STATE: i32 = 15;

/// Error table matching the server's error codes.
fn error_text(code: i32) -> String {
    let text = match code {
        0 => "OK",
        1 => "Access denied",
        2 => "Unknown command",
        3 => "Invalid argument",
        4 => "Entity exists",
        5 => "No such entity",
        6 => "Connection refused",
        7 => "Protocol error",
        8 => "Timeout",
        9 => "No authentication key",
        10 => "Internal error",
        11 => "Connection terminated",
        12 => "Entity killed",
        13 => "Invalid server",
        14 => "Module initialization failed",
        15 => "Bad state",
        16 => "No data",
        _ => "Unknown error code",
    };
    text.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_text_covers_known_codes() {
        assert_eq!(error_text(ERR_CONNECTION_REFUSED), "Connection refused");
        assert_eq!(error_text(ERR_BAD_STATE), "Bad state");
        assert_eq!(error_text(-3), "Unknown error code");
    }
}

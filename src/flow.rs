//! Flow-control window accounting shared by stream and connection state
//! (§4.4). Windows are signed so that a SETTINGS delta can legally drive
//! them negative without underflowing.
use crate::error::H2Error;
use crate::types::MAX_WINDOW_SIZE;

/// Debits `amount` bytes of DATA payload from a send or recv window.
pub fn debit(window: &mut i64, amount: u32, connection_scoped: bool) -> Result<(), H2Error> {
    *window -= i64::from(amount);
    if *window < 0 {
        return Err(H2Error::flow_control(
            connection_scoped,
            "flow-control window went negative",
        ));
    }
    Ok(())
}

/// Applies a WINDOW_UPDATE increment, rejecting overflow past 2^31-1.
pub fn credit(window: &mut i64, increment: u32, connection_scoped: bool) -> Result<(), H2Error> {
    let updated = *window + i64::from(increment);
    if updated > MAX_WINDOW_SIZE {
        return Err(H2Error::flow_control(
            connection_scoped,
            "WINDOW_UPDATE increment overflows 2^31-1",
        ));
    }
    *window = updated;
    Ok(())
}

/// Applies a SETTINGS_INITIAL_WINDOW_SIZE delta to one stream's send window.
/// Connection-scoped: the offending frame is SETTINGS (stream id 0), so an
/// overflow here must be reported as connection-fatal, not dropped as an
/// unroutable per-stream error (§4.4 "Settings delta").
pub fn apply_initial_window_delta(window: i64, delta: i64) -> Result<i64, H2Error> {
    let updated = window + delta;
    if updated > MAX_WINDOW_SIZE {
        return Err(H2Error::flow_control(
            true,
            "SETTINGS initial window delta overflows a stream's send window",
        ));
    }
    Ok(updated)
}

/// Whether a receiver should replenish `window` back to `initial` now that
/// it has drained to half (or less) of its starting value, and by how much
/// (§4.4 "Replenishment"). Returns `None` once the window is already back at
/// or above `initial` (nothing to send).
#[must_use]
pub fn replenishment(window: i64, initial: i64) -> Option<u32> {
    if window > initial / 2 {
        return None;
    }
    let increment = initial - window;
    if increment <= 0 {
        return None;
    }
    Some(increment.min(i64::from(u32::MAX)) as u32)
}

/// Largest DATA payload we may emit right now, honoring both windows and
/// the peer's advertised max frame size.
#[must_use]
pub fn max_emittable(stream_send_window: i64, conn_send_window: i64, max_frame_size: u32) -> u32 {
    let allowed = stream_send_window.min(conn_send_window).max(0);
    allowed.min(i64::from(max_frame_size)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credit_rejects_overflow() {
        let mut window = MAX_WINDOW_SIZE;
        assert!(credit(&mut window, 1, false).is_err());
    }

    #[test]
    fn credit_accepts_exact_boundary() {
        let mut window = MAX_WINDOW_SIZE - 1;
        credit(&mut window, 1, false).unwrap();
        assert_eq!(window, MAX_WINDOW_SIZE);
    }

    #[test]
    fn debit_rejects_negative() {
        let mut window = 10i64;
        assert!(debit(&mut window, 11, false).is_err());
    }

    #[test]
    fn max_emittable_caps_to_smallest_scope() {
        assert_eq!(max_emittable(100, 50, 16_384), 50);
        assert_eq!(max_emittable(100, 5_000, 64), 64);
        assert_eq!(max_emittable(-5, 100, 16_384), 0);
    }

    #[test]
    fn initial_window_delta_can_go_negative_without_erroring() {
        let updated = apply_initial_window_delta(100, -200).unwrap();
        assert_eq!(updated, -100);
    }
}

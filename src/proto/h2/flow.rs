//! Flow-control window accounting.

/// One direction of one flow-control window.
///
/// The window can go negative when the peer shrinks
/// `SETTINGS_INITIAL_WINDOW_SIZE` below what is already in flight; a
/// negative window simply means no capacity until enough credit returns.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FlowControl {
    window: i64,
}

/// Windows may never exceed this (RFC 9113 §6.9.1).
const MAX_WINDOW_SIZE: i64 = (1 << 31) - 1;

impl FlowControl {
    pub(crate) fn new(initial: u32) -> FlowControl {
        FlowControl {
            window: i64::from(initial),
        }
    }

    /// Capacity currently available, clamped at zero.
    pub(crate) fn available(&self) -> u32 {
        if self.window <= 0 {
            0
        } else {
            self.window.min(i64::from(u32::MAX)) as u32
        }
    }

    /// Claims capacity that is about to be used.
    pub(crate) fn consume(&mut self, n: u32) -> crate::Result<()> {
        if i64::from(n) > self.window {
            return Err(crate::Error::new_flow_control());
        }
        self.window -= i64::from(n);
        Ok(())
    }

    /// Returns capacity, from a WINDOW_UPDATE or from consumed inbound
    /// bytes being acknowledged.
    pub(crate) fn release(&mut self, n: u32) -> crate::Result<()> {
        let next = self.window + i64::from(n);
        if next > MAX_WINDOW_SIZE {
            return Err(crate::Error::new_flow_control());
        }
        self.window = next;
        Ok(())
    }

    /// Applies a change of `SETTINGS_INITIAL_WINDOW_SIZE`. The delta may be
    /// negative, and may push the window negative.
    pub(crate) fn resize(&mut self, delta: i64) {
        self.window += delta;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consume_and_release() {
        let mut flow = FlowControl::new(10);
        assert_eq!(flow.available(), 10);
        flow.consume(4).unwrap();
        assert_eq!(flow.available(), 6);
        flow.release(4).unwrap();
        assert_eq!(flow.available(), 10);
    }

    #[test]
    fn consume_past_window_is_an_error() {
        let mut flow = FlowControl::new(3);
        assert!(flow.consume(4).is_err());
    }

    #[test]
    fn shrink_can_go_negative() {
        let mut flow = FlowControl::new(10);
        flow.consume(10).unwrap();
        flow.resize(-5);
        assert_eq!(flow.available(), 0);
        flow.release(5).unwrap();
        // still under water from the shrink
        assert_eq!(flow.available(), 0);
        flow.release(5).unwrap();
        assert_eq!(flow.available(), 5);
    }

    #[test]
    fn release_overflow_is_an_error() {
        let mut flow = FlowControl::new(u32::MAX >> 1);
        assert!(flow.release(u32::MAX >> 1).is_err());
    }
}

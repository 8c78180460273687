//! Slow-start transmit window, RFC 2661 appendix A / RFC 3931 section 4.2.
//!
//! The congestion window starts at one message and grows by one per
//! acknowledgement until it reaches the slow-start threshold, after which
//! it grows by one per window's worth of acknowledgements (congestion
//! avoidance).  A retransmission halves the threshold and collapses the
//! window back to one.

/// Transmit window state for a reliable transport instance.
#[derive(Debug, Clone, Default)]
pub struct TxWindow {
    /// Congestion window, in messages.
    cwnd: u16,
    /// Slow-start threshold.
    thresh: u16,
    /// Maximum window, from the transport configuration.
    max: u16,
    /// Messages transmitted and not yet acknowledged.
    in_flight: u16,
    /// Acknowledgements accumulated toward the next congestion-avoidance
    /// window increase.
    acc: u16,
}

impl TxWindow {
    /// Resets the window for a transport with the given maximum window.
    pub fn reset(&mut self, max_window: u16) {
        self.cwnd = 1;
        self.thresh = max_window;
        self.max = max_window;
        self.in_flight = 0;
        self.acc = 0;
    }

    /// Returns true when the congestion window permits a transmission.
    #[inline]
    pub fn can_send(&self) -> bool {
        self.in_flight < self.cwnd
    }

    /// Records a transmission.
    pub fn on_send(&mut self) {
        self.in_flight += 1;
    }

    /// Records an acknowledgement for a single message.
    pub fn on_ack(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
        if self.cwnd < self.thresh {
            // Slow start: one increase per ack.
            self.cwnd = std::cmp::min(self.cwnd + 1, self.max);
        } else {
            // Congestion avoidance: one increase per cwnd's worth of acks.
            self.acc += 1;
            if self.acc >= self.cwnd {
                self.acc = 0;
                if self.cwnd < self.max {
                    self.cwnd += 1;
                }
            }
        }
    }

    /// Records a retransmission.
    pub fn on_retransmit(&mut self) {
        self.thresh = std::cmp::max(self.cwnd / 2, 1);
        self.cwnd = 1;
        self.acc = 0;
    }

    /// Current congestion window.
    #[inline]
    pub fn cwnd(&self) -> u16 {
        self.cwnd
    }

    /// Current slow-start threshold.
    #[inline]
    pub fn thresh(&self) -> u16 {
        self.thresh
    }

    /// Messages in flight.
    #[inline]
    pub fn in_flight(&self) -> u16 {
        self.in_flight
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_cwnd_thresh(win: &TxWindow, cwnd: u16, thresh: u16) {
        assert_eq!(win.cwnd(), cwnd, "cwnd");
        assert_eq!(win.thresh(), thresh, "thresh");
    }

    #[test]
    fn test_slow_start() {
        let tx_window = 4u16;

        // Initialise state and validate the window is open.
        let mut win = TxWindow::default();
        win.reset(tx_window);
        assert!(win.can_send());

        // Send a message, validate the window is now closed.
        win.on_send();
        assert!(!win.can_send());

        // Ack it: two messages should now fit before the window closes.
        win.on_ack();
        for _ in 0..2 {
            assert!(win.can_send());
            win.on_send();
        }
        assert!(!win.can_send());

        // Ack the two in flight: four messages should now fit.
        for _ in 0..2 {
            win.on_ack();
        }
        for _ in 0..4 {
            assert!(win.can_send());
            win.on_send();
        }
        assert!(!win.can_send());

        // Ack the four in flight, validate the window never exceeds max.
        for _ in 0..4 {
            win.on_ack();
            assert!(win.can_send());
            assert!(win.cwnd() <= tx_window, "cwnd {} exceeds max", win.cwnd());
        }

        // Retransmit: threshold halves, cwnd collapses.
        assert!(win.can_send());
        win.on_send();
        win.on_retransmit();
        assert!(!win.can_send());
        check_cwnd_thresh(&win, 1, 2);

        // Ack the retransmit: still in slow start.
        win.on_ack();
        assert!(win.can_send());
        check_cwnd_thresh(&win, 2, 2);

        // Congestion avoidance from here on.
        win.on_send();
        win.on_ack();
        check_cwnd_thresh(&win, 2, 2);
        for _ in 0..3 {
            assert!(win.can_send());
            win.on_send();
            win.on_ack();
            check_cwnd_thresh(&win, 3, 2);
        }
        assert!(win.can_send());
        win.on_send();
        win.on_ack();
        check_cwnd_thresh(&win, 4, 2);

        // Lots more traffic: the window stays capped at max.
        for _ in 0..100 {
            assert!(win.can_send());
            win.on_send();
            win.on_ack();
            check_cwnd_thresh(&win, 4, 2);
        }
    }

    #[test]
    fn test_reset_reopens_window() {
        let mut win = TxWindow::default();
        win.reset(1);
        win.on_send();
        assert!(!win.can_send());
        win.reset(1);
        assert!(win.can_send());
    }
}

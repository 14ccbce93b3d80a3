//! Send-side flow control state for one channel direction

/// Remote window credit for outbound data.
///
/// `available == None` means the transport has not reported a window yet;
/// chunks are then only limited by the packet size and the transport applies
/// its own backpressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowWindow {
    available: Option<u32>,
    max_packet: u32,
    sent: u64,
}

impl FlowWindow {
    pub fn new(initial: Option<u32>, max_packet: u32) -> Self {
        Self {
            available: initial,
            max_packet: max_packet.max(1),
            sent: 0,
        }
    }

    /// Size of the next chunk to send out of `wanted` pending bytes.
    ///
    /// Zero means the window is exhausted and the write must be parked.
    pub fn chunk_len(&self, wanted: usize) -> usize {
        let limit = match self.available {
            Some(window) => window.min(self.max_packet),
            None => self.max_packet,
        };
        wanted.min(limit as usize)
    }

    /// Account for `n` bytes handed to the transport.
    pub fn consume(&mut self, n: usize) {
        if let Some(window) = self.available.as_mut() {
            *window = window.saturating_sub(n as u32);
        }
        self.sent += n as u64;
    }

    /// Peer reported its current window size.
    pub fn adjust(&mut self, new_size: u32) {
        self.available = Some(new_size);
    }

    /// Peer granted `n` additional bytes.
    pub fn grant(&mut self, n: u32) {
        self.available = Some(self.available.unwrap_or(0).saturating_add(n));
    }

    pub fn is_exhausted(&self) -> bool {
        self.available == Some(0)
    }

    pub fn available(&self) -> Option<u32> {
        self.available
    }

    pub fn max_packet(&self) -> u32 {
        self.max_packet
    }

    /// Total bytes sent through this window.
    pub fn sent(&self) -> u64 {
        self.sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunks_limited_by_window_and_packet() {
        let mut flow = FlowWindow::new(Some(100), 40);
        assert_eq!(flow.chunk_len(1000), 40);
        flow.consume(40);
        flow.consume(40);
        assert_eq!(flow.available(), Some(20));
        assert_eq!(flow.chunk_len(1000), 20);
        flow.consume(20);
        assert!(flow.is_exhausted());
        assert_eq!(flow.chunk_len(1000), 0);
        assert_eq!(flow.sent(), 100);
    }

    #[test]
    fn test_adjust_reopens_window() {
        let mut flow = FlowWindow::new(Some(0), 16);
        assert!(flow.is_exhausted());
        flow.adjust(8);
        assert_eq!(flow.chunk_len(100), 8);
        flow.grant(4);
        assert_eq!(flow.available(), Some(12));
    }

    #[test]
    fn test_unknown_window_only_packet_bound() {
        let mut flow = FlowWindow::new(None, 32);
        assert_eq!(flow.chunk_len(10), 10);
        assert_eq!(flow.chunk_len(100), 32);
        flow.consume(32);
        assert!(!flow.is_exhausted());
    }

    #[test]
    fn test_consume_never_underflows() {
        let mut flow = FlowWindow::new(Some(5), 16);
        flow.consume(10);
        assert_eq!(flow.available(), Some(0));
    }
}

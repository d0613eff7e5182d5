/// Per-direction defaults advertised during the open handshake (RFC 4254
/// leaves them to the implementation).
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 1 << 24;
pub const DEFAULT_MAXIMUM_PACKET_SIZE: u32 = 1 << 24;

/// Multiplexer configuration struct.
///
/// The defaults are safe for general use; the watermarks only tune when the
/// writability signal toggles, never correctness.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Inbound window advertised for every new channel.
    pub initial_window_size: u32,
    /// Largest data payload accepted from the peer on a single message.
    pub maximum_packet_size: u32,
    /// Queued outbound bytes above which a channel reports itself unwritable.
    pub write_high_watermark: usize,
    /// Queued outbound bytes below which writability is restored.
    pub write_low_watermark: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        let high = DEFAULT_INITIAL_WINDOW_SIZE as usize;
        Self {
            initial_window_size: DEFAULT_INITIAL_WINDOW_SIZE,
            maximum_packet_size: DEFAULT_MAXIMUM_PACKET_SIZE,
            write_high_watermark: high,
            write_low_watermark: high / 2,
        }
    }
}

impl MuxConfig {
    pub fn new() -> Self {
        Self::default()
    }
}

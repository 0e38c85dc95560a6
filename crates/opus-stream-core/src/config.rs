use std::time::Duration;

/// Streaming tuning parameters shared by the chunker and writer loop.
#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// Nominal chunk size in bytes; only the final chunk may be shorter.
    pub packet_size: usize,
    /// Hand-off channel capacity in chunks.
    pub channel_capacity: usize,
    /// Deadline for delivering a single chunk to the client.
    pub write_timeout: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            packet_size: 512,
            channel_capacity: 16,
            write_timeout: Duration::from_secs(5),
        }
    }
}

/// Token-bucket parameters for the admission limiter.
#[derive(Clone, Debug)]
pub struct AdmissionConfig {
    /// One token is replenished per interval.
    pub interval: Duration,
    /// Maximum number of tokens available at once.
    pub burst: u32,
    /// Optional bound on how long a session may wait for admission.
    pub timeout: Option<Duration>,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            burst: 8,
            timeout: None,
        }
    }
}

impl StreamConfig {
    /// Clamp values that would stall the pipeline.
    pub fn normalized(mut self) -> Self {
        self.packet_size = self.packet_size.max(1);
        self.channel_capacity = self.channel_capacity.max(1);
        self
    }
}

//! Runtime-configurable tuning parameters for the protocol engine.
//!
//! All values have sensible defaults. Override via environment variables
//! (prefixed `COURIER_`) or by constructing a custom `CourierConfig`.

use crate::error::{CourierError, Result};
use crate::types::SimTime;

/// Tuning parameters for the protocol engine.
#[derive(Debug, Clone)]
pub struct CourierConfig {
    /// Messages of `count * size_in_bytes` at or below this many bytes use
    /// the eager protocol; larger messages use rendezvous.
    pub short_msg_length: usize,

    /// Number of pre-posted landing buffers for incoming envelopes. Each is
    /// sized `ENVELOPE_SIZE + short_msg_length`.
    pub recv_buffer_count: usize,

    /// Number of scratch buffers available for outgoing envelopes. Scratch
    /// exhaustion is a fatal error.
    pub send_scratch_count: usize,

    /// Unexpected-queue depth at which a warning is logged. The queue itself
    /// is unbounded; each entry pins a landing buffer until matched.
    pub unexpected_watermark: usize,

    /// Fixed cost charged for any simulated memcpy.
    pub copy_latency_base_ns: SimTime,

    /// Additional memcpy cost per KiB copied.
    pub copy_latency_ns_per_kib: SimTime,
}

impl Default for CourierConfig {
    fn default() -> Self {
        Self {
            short_msg_length: 4096,
            recv_buffer_count: 32,
            send_scratch_count: 16,
            unexpected_watermark: 16,
            copy_latency_base_ns: 100,
            copy_latency_ns_per_kib: 64, // ~16 GB/s
        }
    }
}

impl CourierConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `COURIER_SHORT_MSG_LENGTH`
    /// - `COURIER_RECV_BUFFER_COUNT`
    /// - `COURIER_SEND_SCRATCH_COUNT`
    /// - `COURIER_UNEXPECTED_WATERMARK`
    /// - `COURIER_COPY_LATENCY_BASE_NS`
    /// - `COURIER_COPY_LATENCY_NS_PER_KIB`
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("COURIER_SHORT_MSG_LENGTH") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.short_msg_length = n;
            }
        }
        if let Ok(v) = std::env::var("COURIER_RECV_BUFFER_COUNT") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.recv_buffer_count = n;
            }
        }
        if let Ok(v) = std::env::var("COURIER_SEND_SCRATCH_COUNT") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.send_scratch_count = n;
            }
        }
        if let Ok(v) = std::env::var("COURIER_UNEXPECTED_WATERMARK") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.unexpected_watermark = n;
            }
        }
        if let Ok(v) = std::env::var("COURIER_COPY_LATENCY_BASE_NS") {
            if let Ok(n) = v.parse::<u64>() {
                cfg.copy_latency_base_ns = n;
            }
        }
        if let Ok(v) = std::env::var("COURIER_COPY_LATENCY_NS_PER_KIB") {
            if let Ok(n) = v.parse::<u64>() {
                cfg.copy_latency_ns_per_kib = n;
            }
        }

        cfg
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.short_msg_length == 0 {
            return Err(CourierError::InvalidConfig(
                "short_msg_length must be non-zero",
            ));
        }
        if self.recv_buffer_count == 0 {
            return Err(CourierError::InvalidConfig(
                "recv_buffer_count must be at least 1",
            ));
        }
        if self.send_scratch_count == 0 {
            return Err(CourierError::InvalidConfig(
                "send_scratch_count must be at least 1",
            ));
        }
        Ok(())
    }

    /// Simulated latency of copying `bytes` through the CPU.
    pub fn copy_latency(&self, bytes: usize) -> SimTime {
        self.copy_latency_base_ns + (bytes as u64 * self.copy_latency_ns_per_kib) / 1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        CourierConfig::default().validate().unwrap();
    }

    #[test]
    fn test_zero_threshold_rejected() {
        let cfg = CourierConfig {
            short_msg_length: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_zero_pool_rejected() {
        let cfg = CourierConfig {
            recv_buffer_count: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_copy_latency_proportional() {
        let cfg = CourierConfig {
            copy_latency_base_ns: 100,
            copy_latency_ns_per_kib: 64,
            ..Default::default()
        };
        assert_eq!(cfg.copy_latency(0), 100);
        assert_eq!(cfg.copy_latency(1024), 164);
        assert!(cfg.copy_latency(8192) > cfg.copy_latency(1024));
    }
}

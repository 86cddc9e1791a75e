//! Configuration types for the link

use crate::common::constants;
use crate::error::{LinkError, Result};

/// Link configuration builder
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Initial baud rate
    pub baud: u32,
    /// Candidate rates cycled while probing (auto-baud)
    pub baud_candidates: Vec<u32>,
    /// Unacknowledged frame window per direction
    pub frame_window: u8,
    /// Maximum payload bytes per frame
    pub max_payload: u16,
    /// Retransmissions of one frame before the link fails
    pub retransmit_limit: u32,
    /// Floor for the baud-derived retransmit timeout, milliseconds
    pub retransmit_base_ms: u32,
    /// Initial byte credit granted per inbound channel
    pub channel_credit: u32,
    /// Pending chunks allowed per outbound channel
    pub queue_limit: usize,
    /// Shared-channel request deadline, milliseconds
    pub request_timeout_ms: u32,
    /// Idle keep-alive interval, milliseconds; `None` disables probing
    pub keep_alive_ms: Option<u32>,
    /// Opaque option string handed to the driver
    pub driver_options: Option<String>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            baud: 115_200,
            baud_candidates: vec![115_200, 57_600, 38_400, 19_200, 9_600],
            frame_window: constants::WINDOW_DEF,
            max_payload: constants::PAYLOAD_DEF,
            retransmit_limit: constants::RETRY_LIMIT_DEF,
            retransmit_base_ms: constants::RETRY_BASE_MS,
            channel_credit: constants::CREDIT_DEF,
            queue_limit: constants::QUEUE_LIMIT_DEF,
            request_timeout_ms: constants::REQUEST_TIMEOUT_MS,
            keep_alive_ms: Some(constants::KEEPALIVE_MS),
            driver_options: None,
        }
    }
}

impl LinkConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the initial baud rate
    pub fn baud(mut self, baud: u32) -> Self {
        self.baud = baud;
        self
    }

    /// Set the rates cycled while probing
    pub fn baud_candidates(mut self, rates: Vec<u32>) -> Self {
        self.baud_candidates = rates;
        self
    }

    /// Set the unacknowledged frame window
    pub fn frame_window(mut self, window: u8) -> Self {
        self.frame_window = window;
        self
    }

    /// Set the maximum payload per frame
    pub fn max_payload(mut self, payload: u16) -> Self {
        self.max_payload = payload;
        self
    }

    /// Set the retransmission limit
    pub fn retransmit_limit(mut self, limit: u32) -> Self {
        self.retransmit_limit = limit;
        self
    }

    /// Set the initial per-channel credit
    pub fn channel_credit(mut self, credit: u32) -> Self {
        self.channel_credit = credit;
        self
    }

    /// Set the per-channel pending chunk limit
    pub fn queue_limit(mut self, limit: usize) -> Self {
        self.queue_limit = limit;
        self
    }

    /// Set the shared-channel request deadline
    pub fn request_timeout_ms(mut self, ms: u32) -> Self {
        self.request_timeout_ms = ms;
        self
    }

    /// Set the keep-alive interval
    pub fn keep_alive_ms(mut self, ms: Option<u32>) -> Self {
        self.keep_alive_ms = ms;
        self
    }

    /// Set the opaque driver option string
    pub fn driver_options(mut self, options: impl Into<String>) -> Self {
        self.driver_options = Some(options.into());
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.baud == 0 {
            return Err(LinkError::bad_parms("baud rate must be greater than 0"));
        }

        if self.frame_window == 0 || self.frame_window > 127 {
            return Err(LinkError::bad_parms("frame window must be in 1..=127"));
        }

        if self.max_payload == 0 {
            return Err(LinkError::bad_parms("max payload must be greater than 0"));
        }

        if self.retransmit_limit == 0 {
            return Err(LinkError::bad_parms(
                "retransmit limit must be greater than 0",
            ));
        }

        if self.queue_limit == 0 {
            return Err(LinkError::bad_parms("queue limit must be greater than 0"));
        }

        if self.request_timeout_ms == 0 {
            return Err(LinkError::bad_parms(
                "request timeout must be greater than 0",
            ));
        }

        Ok(())
    }
}

/// Preset configurations for common transports
impl LinkConfig {
    /// Configuration for a direct serial cable
    pub fn direct_cable() -> Self {
        Self::default()
            .baud(115_200)
            .frame_window(8)
            .max_payload(512)
    }

    /// Configuration for an infrared adapter: slower, lossier medium
    pub fn infrared() -> Self {
        Self::default()
            .baud(19_200)
            .baud_candidates(vec![19_200, 9_600])
            .frame_window(2)
            .max_payload(128)
            .retransmit_limit(16)
    }

    /// Configuration for tests: no keep-alive, short deadlines
    pub fn testing() -> Self {
        Self::default()
            .keep_alive_ms(None)
            .request_timeout_ms(1_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_valid() {
        assert!(LinkConfig::default().validate().is_ok());
        assert!(LinkConfig::direct_cable().validate().is_ok());
        assert!(LinkConfig::infrared().validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_window() {
        let config = LinkConfig::default().frame_window(0);
        assert!(config.validate().is_err());
    }
}

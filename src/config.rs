use std::time::Duration;

use crate::flight::MAX_FLIGHT_LENGTH;
use crate::transport::Mode;
use crate::Error;

/// Stack configuration.
///
/// Built once via [`Config::builder`], then shared immutably.
#[derive(Debug, Clone)]
pub struct Config {
    mode: Mode,
    mtu: usize,
    max_record_payload: usize,
    retransmit_timeout_min: Duration,
    retransmit_timeout_max: Duration,
    max_flight_length: usize,
    future_message_buffers: usize,
    finalize_resends: usize,
    exhaust_after: usize,
    max_handshake_len: usize,
    max_queue_tx: usize,
}

impl Config {
    /// Create a new configuration builder.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder {
            mode: Mode::Datagram,
            mtu: 1400,
            max_record_payload: 1200,
            retransmit_timeout_min: Duration::from_secs(1),
            retransmit_timeout_max: Duration::from_secs(60),
            max_flight_length: 5,
            future_message_buffers: 4,
            finalize_resends: 1,
            exhaust_after: 2,
            max_handshake_len: 65536,
            max_queue_tx: 8,
        }
    }

    /// Stream or datagram pipeline.
    #[inline(always)]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Largest datagram the stack will produce.
    #[inline(always)]
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Largest record plaintext the stack will produce.
    #[inline(always)]
    pub fn max_record_payload(&self) -> usize {
        self.max_record_payload
    }

    /// Initial retransmission timeout.
    #[inline(always)]
    pub fn retransmit_timeout_min(&self) -> Duration {
        self.retransmit_timeout_min
    }

    /// Cap for the doubling retransmission timeout.
    #[inline(always)]
    pub fn retransmit_timeout_max(&self) -> Duration {
        self.retransmit_timeout_max
    }

    /// Max number of messages in one outgoing flight.
    #[inline(always)]
    pub fn max_flight_length(&self) -> usize {
        self.max_flight_length
    }

    /// Number of future handshake messages buffered ahead of the next
    /// expected one.
    #[inline(always)]
    pub fn future_message_buffers(&self) -> usize {
        self.future_message_buffers
    }

    /// Retransmissions attempted while holding the final flight.
    #[inline(always)]
    pub fn finalize_resends(&self) -> usize {
        self.finalize_resends
    }

    /// Expiries at the maximum timeout tolerated before the handshake is
    /// abandoned.
    #[inline(always)]
    pub fn exhaust_after(&self) -> usize {
        self.exhaust_after
    }

    /// Upper bound on a single handshake message.
    #[inline(always)]
    pub fn max_handshake_len(&self) -> usize {
        self.max_handshake_len
    }

    /// Prepared datagrams buffered before the write side reports
    /// `WantWrite`.
    #[inline(always)]
    pub fn max_queue_tx(&self) -> usize {
        self.max_queue_tx
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::builder()
            .build()
            .expect("default config must validate")
    }
}

/// Builder for [`Config`].
#[derive(Debug)]
pub struct ConfigBuilder {
    mode: Mode,
    mtu: usize,
    max_record_payload: usize,
    retransmit_timeout_min: Duration,
    retransmit_timeout_max: Duration,
    max_flight_length: usize,
    future_message_buffers: usize,
    finalize_resends: usize,
    exhaust_after: usize,
    max_handshake_len: usize,
    max_queue_tx: usize,
}

impl ConfigBuilder {
    /// Select stream or datagram operation. Defaults to datagram.
    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the largest datagram to produce. Defaults to 1400.
    pub fn mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    /// Set the largest record plaintext to produce. Defaults to 1200.
    pub fn max_record_payload(mut self, max: usize) -> Self {
        self.max_record_payload = max;
        self
    }

    /// Set the initial retransmission timeout. Defaults to 1 second.
    ///
    /// Doubled on every expiry without progress.
    pub fn retransmit_timeout_min(mut self, t: Duration) -> Self {
        self.retransmit_timeout_min = t;
        self
    }

    /// Set the retransmission timeout cap. Defaults to 60 seconds.
    pub fn retransmit_timeout_max(mut self, t: Duration) -> Self {
        self.retransmit_timeout_max = t;
        self
    }

    /// Set the max messages per outgoing flight. Defaults to 5, capped at
    /// [`MAX_FLIGHT_LENGTH`].
    pub fn max_flight_length(mut self, n: usize) -> Self {
        self.max_flight_length = n;
        self
    }

    /// Set the number of future-message buffers. Defaults to 4.
    pub fn future_message_buffers(mut self, n: usize) -> Self {
        self.future_message_buffers = n;
        self
    }

    /// Set how often the final flight is resent on timeout before giving
    /// up on the peer. Defaults to 1.
    pub fn finalize_resends(mut self, n: usize) -> Self {
        self.finalize_resends = n;
        self
    }

    /// Set how many expiries at the maximum timeout are tolerated before
    /// the handshake fails. Defaults to 2.
    pub fn exhaust_after(mut self, n: usize) -> Self {
        self.exhaust_after = n;
        self
    }

    /// Set the upper bound on a single handshake message. Defaults to
    /// 65536.
    pub fn max_handshake_len(mut self, n: usize) -> Self {
        self.max_handshake_len = n;
        self
    }

    /// Set how many prepared datagrams may queue before the write side
    /// reports `WantWrite`. Defaults to 8.
    pub fn max_queue_tx(mut self, n: usize) -> Self {
        self.max_queue_tx = n;
        self
    }

    /// Validate and build the configuration.
    pub fn build(self) -> Result<Config, Error> {
        if self.max_flight_length == 0 || self.max_flight_length > MAX_FLIGHT_LENGTH {
            return Err(Error::BadInput("max_flight_length out of range"));
        }
        if self.retransmit_timeout_min > self.retransmit_timeout_max {
            return Err(Error::BadInput("retransmit timeout min exceeds max"));
        }
        if self.retransmit_timeout_min.is_zero() {
            return Err(Error::BadInput("retransmit timeout must be non-zero"));
        }
        if self.max_record_payload < 64 {
            return Err(Error::BadInput("max_record_payload too small"));
        }
        // A datagram must at least hold a record header plus a handshake
        // fragment header and some payload.
        if self.mode == Mode::Datagram && self.mtu < 256 {
            return Err(Error::BadInput("mtu too small"));
        }

        Ok(Config {
            mode: self.mode,
            mtu: self.mtu,
            max_record_payload: self.max_record_payload,
            retransmit_timeout_min: self.retransmit_timeout_min,
            retransmit_timeout_max: self.retransmit_timeout_max,
            max_flight_length: self.max_flight_length,
            future_message_buffers: self.future_message_buffers,
            finalize_resends: self.finalize_resends,
            exhaust_after: self.exhaust_after,
            max_handshake_len: self.max_handshake_len,
            max_queue_tx: self.max_queue_tx,
        })
    }
}

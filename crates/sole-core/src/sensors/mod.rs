//! The insole sensor array: 31 MAX31725 temperature sensors on one I2C bus.
//!
//! The bus itself is a collaborator supplied as an
//! [`embedded_hal_async::i2c::I2c`] implementation; bounded transaction
//! timeouts are its responsibility. Channel failures are isolated: a sensor
//! that stops responding degrades its own channel to code 0 and nothing
//! else.

pub mod max31725;

use embedded_hal_async::i2c::I2c;
use log::{debug, warn};
use thiserror_no_std::Error;

use crate::storage::CHANNEL_COUNT;
use max31725::{CONFIG_ONE_SHOT, CONFIG_SHUTDOWN, REG_CONFIGURATION, REG_TEMPERATURE};

/// MAX31725 8-bit addresses in channel order, as routed on the insole.
/// Position u1 is not populated. Addresses are shifted to 7-bit on the bus.
pub const SENSOR_ADDRESSES: [u8; CHANNEL_COUNT] = [
    // u2    u3    u4    u5    u6    u7    u8
    0x92, 0x82, 0x80, 0x94, 0x96, 0x86, 0x84,
    // u9    u10   u11   u12   u13   u14   u15   u16
    0xb4, 0xb6, 0xa6, 0xa4, 0xb0, 0xb2, 0xa2, 0xa0,
    // u17   u18   u19   u20   u21   u22   u23   u24
    0x98, 0x9a, 0x8a, 0x88, 0x9c, 0x9e, 0x8e, 0x8c,
    // u25   u26   u27   u28   u29   u30   u31   u32
    0xbc, 0xbe, 0xae, 0xac, 0xb8, 0xba, 0xaa, 0xa8,
];

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorError {
    #[error("sensor channel {channel} did not respond")]
    ChannelRead { channel: usize },
    #[error("bus transaction failed")]
    Bus,
}

/// Owns the sensor bus and addresses every channel in fixed order.
pub struct SensorArray<B> {
    bus: B,
}

impl<B: I2c> SensorArray<B> {
    pub fn new(bus: B) -> Self {
        Self { bus }
    }

    /// Configures every channel for one-shot operation (shutdown mode).
    ///
    /// Called once at startup. A channel that fails to configure is logged
    /// and left alone; it will read as code 0 until it recovers.
    pub async fn init_all(&mut self) {
        for (channel, address) in SENSOR_ADDRESSES.iter().enumerate() {
            if let Err(e) = self.init_channel(*address).await {
                warn!("failed to initialize sensor channel {}: {}", channel, e);
            }
        }
    }

    async fn init_channel(&mut self, address: u8) -> Result<(), SensorError> {
        let address = address >> 1;

        self.bus
            .write(address, &[REG_CONFIGURATION, CONFIG_SHUTDOWN])
            .await
            .map_err(|_| SensorError::Bus)?;

        // Leave the register pointer on the configuration register so the
        // conversion-ready poll is a plain read.
        self.bus
            .write(address, &[REG_CONFIGURATION])
            .await
            .map_err(|_| SensorError::Bus)
    }

    /// Fires a one-shot conversion on every channel, ascending order.
    ///
    /// Fire-and-forget: a channel that refuses the trigger simply keeps its
    /// previous conversion result.
    pub async fn begin_conversion_all(&mut self) {
        let frame = [REG_CONFIGURATION, CONFIG_ONE_SHOT | CONFIG_SHUTDOWN];

        for (channel, address) in SENSOR_ADDRESSES.iter().enumerate() {
            if self.bus.write(*address >> 1, &frame).await.is_err() {
                debug!("one-shot trigger failed on channel {}", channel);
            }
        }
    }

    /// Polls whether the last channel's conversion is still running.
    ///
    /// A single best-effort check after the settle delay; if the status
    /// cannot be read at all, the answer is "not pending" and the per-channel
    /// reads surface any real failure.
    pub async fn conversion_pending(&mut self) -> bool {
        let address = SENSOR_ADDRESSES[CHANNEL_COUNT - 1] >> 1;
        let mut config = [0u8; 1];

        match self
            .bus
            .write_read(address, &[REG_CONFIGURATION], &mut config)
            .await
        {
            Ok(()) => config[0] & CONFIG_ONE_SHOT != 0,
            Err(_) => false,
        }
    }

    /// Reads every channel into `values`, fixed order.
    ///
    /// An unreadable channel yields code 0 instead of failing the cycle.
    pub async fn read_all(&mut self, values: &mut [u8; CHANNEL_COUNT]) {
        for (channel, address) in SENSOR_ADDRESSES.iter().enumerate() {
            values[channel] = match self.read_channel(channel, *address).await {
                Ok(code) => code,
                Err(e) => {
                    debug!("substituting 0 for channel {}: {}", channel, e);
                    0
                }
            };
        }
    }

    async fn read_channel(&mut self, channel: usize, address: u8) -> Result<u8, SensorError> {
        let mut raw = [0u8; 2];

        self.bus
            .write_read(address >> 1, &[REG_TEMPERATURE], &mut raw)
            .await
            .map_err(|_| SensorError::ChannelRead { channel })?;

        Ok(max31725::temperature_code(raw[0], raw[1]))
    }
}

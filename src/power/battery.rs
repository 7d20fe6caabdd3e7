//! UPS-Lite battery level from the CW2015 fuel gauge

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::BatteryConfig;

pub const CW2015_REG_VCELL: u8 = 0x02;
pub const CW2015_REG_SOC: u8 = 0x04;
pub const CW2015_REG_MODE: u8 = 0x0A;
/// Written to MODE to restart the gauge's estimation
pub const CW2015_MODE_QUICK_START: u8 = 0x30;

/// Cell voltage LSB, microvolts
const VCELL_LSB_UV: f32 = 305.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BatteryStatus {
    /// State of charge, 0..=100
    pub percentage: f32,
    pub voltage: f32,
}

/// SOC registers: integer percent plus 1/256 percent
pub fn decode_soc(high: u8, low: u8) -> f32 {
    (f32::from(high) + f32::from(low) / 256.0).clamp(0.0, 100.0)
}

/// VCELL registers: 14-bit reading in 305uV steps, returned in volts
pub fn decode_voltage(high: u8, low: u8) -> f32 {
    let raw = (u16::from(high) << 8 | u16::from(low)) & 0x3FFF;
    f32::from(raw) * VCELL_LSB_UV / 1_000_000.0
}

pub trait FuelGauge: Send {
    fn read(&mut self) -> anyhow::Result<BatteryStatus>;
}

#[cfg(all(feature = "gpio", any(target_arch = "arm", target_arch = "aarch64")))]
pub use cw2015::Cw2015;

#[cfg(all(feature = "gpio", any(target_arch = "arm", target_arch = "aarch64")))]
mod cw2015 {
    use super::*;
    use anyhow::Result;
    use rppal::i2c::I2c;
    use std::thread;

    pub struct Cw2015 {
        i2c: I2c,
    }

    impl Cw2015 {
        fn write_reg(&mut self, reg: u8, val: u8) -> Result<()> {
            self.i2c.write(&[reg, val])?;
            Ok(())
        }

        fn read_reg(&mut self, reg: u8) -> Result<u8> {
            let mut data = [0u8; 1];
            self.i2c.write_read(&[reg], &mut data)?;
            Ok(data[0])
        }

        pub fn new(bus: u8, address: u16) -> Result<Self> {
            let mut i2c = I2c::with_bus(bus)?;
            i2c.set_slave_address(address)?;
            let mut gauge = Cw2015 { i2c };

            // wake the gauge, it may have been left asleep
            gauge.write_reg(CW2015_REG_MODE, CW2015_MODE_QUICK_START)?;
            thread::sleep(Duration::from_millis(200));
            Ok(gauge)
        }
    }

    impl FuelGauge for Cw2015 {
        fn read(&mut self) -> Result<BatteryStatus> {
            let soc_high = self.read_reg(CW2015_REG_SOC)?;
            let soc_low = self.read_reg(CW2015_REG_SOC + 1)?;
            let vcell_high = self.read_reg(CW2015_REG_VCELL)?;
            let vcell_low = self.read_reg(CW2015_REG_VCELL + 1)?;
            Ok(BatteryStatus {
                percentage: decode_soc(soc_high, soc_low),
                voltage: decode_voltage(vcell_high, vcell_low),
            })
        }
    }
}

/// Latest battery reading, shared with the status endpoint
#[derive(Clone, Default)]
pub struct BatteryMonitor {
    latest: Arc<RwLock<Option<BatteryStatus>>>,
}

impl BatteryMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self) -> Option<BatteryStatus> {
        *self.latest.read()
    }

    pub fn record(&self, status: BatteryStatus) {
        *self.latest.write() = Some(status);
    }

    /// Poll `gauge` every `interval`; reads run on the blocking pool
    pub fn spawn_polling(
        &self,
        gauge: Box<dyn FuelGauge>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let monitor = self.clone();
        let gauge = Arc::new(Mutex::new(gauge));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let gauge = Arc::clone(&gauge);
                let read = tokio::task::spawn_blocking(move || {
                    let mut gauge = gauge.lock();
                    gauge.read()
                });
                match read.await {
                    Ok(Ok(status)) => {
                        debug!(
                            percentage = status.percentage,
                            voltage = status.voltage,
                            "Battery read"
                        );
                        monitor.record(status);
                    }
                    Ok(Err(e)) => warn!(error = %e, "Battery read failed"),
                    Err(e) => {
                        warn!(error = %e, "Battery poll task failed, stopping");
                        break;
                    }
                }
            }
        })
    }
}

/// Open the configured gauge, `None` when disabled or unavailable
pub fn open_gauge(config: &BatteryConfig) -> Option<Box<dyn FuelGauge>> {
    if !config.enabled {
        return None;
    }
    open_cw2015(config)
}

#[cfg(all(feature = "gpio", any(target_arch = "arm", target_arch = "aarch64")))]
fn open_cw2015(config: &BatteryConfig) -> Option<Box<dyn FuelGauge>> {
    match Cw2015::new(config.i2c_bus, config.address) {
        Ok(gauge) => Some(Box::new(gauge)),
        Err(e) => {
            warn!(error = %e, address = config.address, "UPS-Lite fuel gauge not found");
            None
        }
    }
}

#[cfg(not(all(feature = "gpio", any(target_arch = "arm", target_arch = "aarch64"))))]
fn open_cw2015(_config: &BatteryConfig) -> Option<Box<dyn FuelGauge>> {
    warn!("Battery gauge enabled but this build has no I2C support");
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_soc() {
        assert_eq!(decode_soc(87, 128), 87.5);
        assert_eq!(decode_soc(0, 0), 0.0);
        // gauge can report slightly above full while charging
        assert_eq!(decode_soc(101, 0), 100.0);
    }

    #[test]
    fn test_decode_voltage() {
        // 0x3520 = 13600 steps of 305uV
        let v = decode_voltage(0x35, 0x20);
        assert!((v - 4.148).abs() < 0.001);
        // top two bits are not part of the reading
        assert_eq!(decode_voltage(0xC0, 0x00), 0.0);
    }

    struct Fixed(f32);

    impl FuelGauge for Fixed {
        fn read(&mut self) -> anyhow::Result<BatteryStatus> {
            Ok(BatteryStatus {
                percentage: self.0,
                voltage: 3.9,
            })
        }
    }

    #[tokio::test]
    async fn test_polling_updates_latest() {
        let monitor = BatteryMonitor::new();
        assert_eq!(monitor.latest(), None);

        let _task = monitor.spawn_polling(Box::new(Fixed(64.0)), Duration::from_millis(10));
        for _ in 0..100 {
            if monitor.latest().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(monitor.latest().map(|s| s.percentage), Some(64.0));
    }

    #[test]
    fn test_disabled_gauge_is_not_opened() {
        assert!(open_gauge(&BatteryConfig::default()).is_none());
    }
}

//! Thermistor temperature sensing through an ADS1115 I²C ADC.
//!
//! Circuit: Vcc → R1 → (ADC input, NTC thermistor R0 → GND). The β-parameter
//! equation converts the divider voltage into Celsius. The ADC uses its
//! internal reference, so Vcc must be well regulated.

use std::io;
use std::sync::Mutex;
use std::time::Duration;

use core_hal::TemperatureError;

const ADS111X_ADDRESS: libc::c_ulong = 0x48;
const I2C_SLAVE: libc::c_ulong = 0x0703;

const CELSIUS_TO_KELVIN: f64 = 273.15;
const VCC: f64 = 3.3;
const R0: f64 = 100_000.0;
const T0: f64 = 25.0;
const BETA: f64 = 4092.0;
const R1: f64 = 4700.0;

/// ADS1115 on `/dev/i2c-1`. A single lock serialises conversions across the
/// heater threads.
pub struct Ads1115 {
    fd: Mutex<libc::c_int>,
}

impl Ads1115 {
    pub fn new() -> io::Result<Self> {
        let path = std::ffi::CString::new("/dev/i2c-1").expect("device path");
        let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDWR | libc::O_SYNC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::ioctl(fd, I2C_SLAVE, ADS111X_ADDRESS) } < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }
        Ok(Self { fd: Mutex::new(fd) })
    }

    fn write(&self, fd: libc::c_int, data: &[u8]) -> io::Result<()> {
        let n = unsafe { libc::write(fd, data.as_ptr().cast(), data.len()) };
        if n != data.len() as isize {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn read_u16(&self, fd: libc::c_int) -> io::Result<u16> {
        let mut buf = [0u8; 2];
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), 2) };
        if n != 2 {
            return Err(io::Error::last_os_error());
        }
        Ok(u16::from_be_bytes(buf))
    }

    /// Single-shot conversion on `channel` (0..=3), ±4.096 V range, AINN at
    /// ground. Returns Volts.
    pub fn measure(&self, channel: u8) -> io::Result<f64> {
        if channel > 3 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "ads1115 has four channels",
            ));
        }
        let fd = self.fd.lock().expect("i2c lock poisoned");
        let config: u16 = ((0b100 | channel as u16) << 12) | 0x8380;
        let mut request = [0u8; 3];
        request[0] = 0x01; // config register
        request[1..].copy_from_slice(&config.to_be_bytes());
        self.write(*fd, &request)?;
        // wait for the conversion-ready bit
        loop {
            self.write(*fd, &[0x01])?;
            if self.read_u16(*fd)? & 0x8000 != 0 {
                break;
            }
            std::thread::sleep(Duration::from_micros(100));
        }
        self.write(*fd, &[0x00])?; // conversion register
        let raw = self.read_u16(*fd)? as i16;
        // 32768 counts over the 4.096 V range
        Ok(raw as f64 / 8000.0)
    }
}

impl Drop for Ads1115 {
    fn drop(&mut self) {
        let fd = self.fd.lock().expect("i2c lock poisoned");
        unsafe { libc::close(*fd) };
    }
}

/// β-equation thermistor resistance at infinity.
fn r_infinity() -> f64 {
    R0 * (-BETA / (T0 + CELSIUS_TO_KELVIN)).exp()
}

/// Convert a measured divider voltage into Celsius, classifying the two
/// hard-fault voltages.
pub fn voltage_to_celsius(volts: f64) -> Result<f64, TemperatureError> {
    if volts >= VCC {
        return Err(TemperatureError::OpenCircuit);
    }
    if volts <= 0.0 {
        return Err(TemperatureError::ShortCircuit);
    }
    let resistance = volts * R1 / (VCC - volts);
    Ok(BETA / (resistance / r_infinity()).ln() - CELSIUS_TO_KELVIN)
}

/// Full read path for one ADC channel.
pub fn read_temperature(adc: Option<&Ads1115>, channel: u8) -> Result<f64, TemperatureError> {
    let adc = adc.ok_or(TemperatureError::SensorAbsent)?;
    let volts = adc
        .measure(channel)
        .map_err(|e| TemperatureError::Io(e.to_string()))?;
    voltage_to_celsius(volts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_voltages_classify() {
        assert_eq!(voltage_to_celsius(3.3), Err(TemperatureError::OpenCircuit));
        assert_eq!(voltage_to_celsius(4.0), Err(TemperatureError::OpenCircuit));
        assert_eq!(voltage_to_celsius(0.0), Err(TemperatureError::ShortCircuit));
        assert_eq!(
            voltage_to_celsius(-0.1),
            Err(TemperatureError::ShortCircuit)
        );
    }

    #[test]
    fn divider_midpoints_map_to_sane_temperatures() {
        // thermistor at R0 (100k) puts the divider near Vcc: cold
        let v_cold = VCC * R0 / (R0 + R1);
        let t = voltage_to_celsius(v_cold).unwrap();
        assert!((t - T0).abs() < 0.5, "expected ~25C, got {t}");

        // hot thermistor, low resistance, low voltage
        let v_hot = 0.1;
        let t_hot = voltage_to_celsius(v_hot).unwrap();
        assert!(t_hot > 150.0, "expected a hot reading, got {t_hot}");

        // monotonic: more voltage, colder
        let t1 = voltage_to_celsius(1.0).unwrap();
        let t2 = voltage_to_celsius(2.0).unwrap();
        assert!(t1 > t2);
    }

    #[test]
    fn missing_adc_reports_absent_sensor() {
        assert_eq!(
            read_temperature(None, 0),
            Err(TemperatureError::SensorAbsent)
        );
    }
}

//! Built-in simulated drivers.
//!
//! Register-level hardware access is an external collaborator; these
//! drivers generate plausible readings so the agent runs end-to-end on
//! a host. They still implement the real parameter semantics (unit
//! conversion, calibration) so the orchestration paths are exercised
//! for real.

use serde_json::json;

use mote_core::{DriverError, DriverSet, SensorDriver};

/// Register every built-in driver type.
pub fn register_builtin(set: &mut DriverSet) {
    set.register("temperature_humidity", |args| {
        Ok(Box::new(TemperatureHumidity::new(args)) as Box<dyn SensorDriver>)
    });
    set.register("soil_moisture", |args| {
        SoilMoisture::new(args).map(|d| Box::new(d) as Box<dyn SensorDriver>)
    });
}

// ── Temperature / humidity ───────────────────────────────────────────

/// Simulated combined sensor. Readings oscillate slowly around a
/// baseline; output units follow the `unit_temperature` and
/// `unit_humidity` parameters.
struct TemperatureHumidity {
    tick: u32,
    unit_temperature: String,
    unit_humidity: String,
}

impl TemperatureHumidity {
    fn new(args: &mote_core::ParameterMap) -> Self {
        let pick = |key: &str, fallback: &str| {
            args.get(key)
                .and_then(serde_json::Value::as_str)
                .unwrap_or(fallback)
                .to_owned()
        };
        Self {
            tick: 0,
            unit_temperature: pick("unit_temperature", "Celsius"),
            unit_humidity: pick("unit_humidity", "percentage"),
        }
    }

    fn convert_temperature(&self, celsius: f64) -> f64 {
        match self.unit_temperature.as_str() {
            "Fahrenheit" => celsius * 9.0 / 5.0 + 32.0,
            "Kelvin" => celsius + 273.15,
            _ => celsius,
        }
    }

    fn convert_humidity(&self, percentage: f64) -> f64 {
        match self.unit_humidity.as_str() {
            "fraction" => percentage / 100.0,
            "per_mille" => percentage * 10.0,
            _ => percentage,
        }
    }
}

impl SensorDriver for TemperatureHumidity {
    fn read(&mut self, capability: &str) -> Result<serde_json::Value, DriverError> {
        self.tick = self.tick.wrapping_add(1);
        let phase = f64::from(self.tick % 360).to_radians();
        match capability {
            "temperature" => {
                let celsius = 21.0 + 3.0 * phase.sin();
                Ok(json!(round2(self.convert_temperature(celsius))))
            }
            "humidity" => {
                let percentage = 55.0 + 10.0 * phase.cos();
                Ok(json!(round2(self.convert_humidity(percentage))))
            }
            other => Err(DriverError::Unsupported(other.to_owned())),
        }
    }

    fn write(&mut self, key: &str, value: &serde_json::Value) -> Result<(), DriverError> {
        let as_str = || {
            value
                .as_str()
                .ok_or_else(|| DriverError::Write(format!("{key} must be a string")))
        };
        match key {
            "unit_temperature" => {
                let unit = as_str()?;
                if !["Celsius", "Fahrenheit", "Kelvin"].contains(&unit) {
                    return Err(DriverError::Write(format!(
                        "unknown temperature unit '{unit}'"
                    )));
                }
                self.unit_temperature = unit.to_owned();
                Ok(())
            }
            "unit_humidity" => {
                let unit = as_str()?;
                if !["percentage", "fraction", "per_mille"].contains(&unit) {
                    return Err(DriverError::Write(format!("unknown humidity unit '{unit}'")));
                }
                self.unit_humidity = unit.to_owned();
                Ok(())
            }
            // Host-side parameters pass through untouched.
            _ => Ok(()),
        }
    }
}

// ── Soil moisture ────────────────────────────────────────────────────

/// Simulated resistive soil probe. Raw readings sweep the calibrated
/// range; `moisture` is the linear interpolation between the dry and
/// wet calibration points, clamped to 0..=100.
struct SoilMoisture {
    tick: u32,
    dry_raw: u16,
    wet_raw: u16,
}

impl SoilMoisture {
    fn new(args: &mote_core::ParameterMap) -> Result<Self, DriverError> {
        let raw_arg = |key: &str, fallback: u16| -> Result<u16, DriverError> {
            match args.get(key) {
                None => Ok(fallback),
                Some(value) => value
                    .as_u64()
                    .and_then(|v| u16::try_from(v).ok())
                    .ok_or_else(|| {
                        DriverError::Construction(format!("{key} must fit a 16-bit ADC value"))
                    }),
            }
        };

        let dry_raw = raw_arg("dry_raw", 2188)?;
        let wet_raw = raw_arg("wet_raw", 4095)?;
        if dry_raw >= wet_raw {
            return Err(DriverError::Construction(format!(
                "dry_raw ({dry_raw}) must be below wet_raw ({wet_raw})"
            )));
        }

        Ok(Self {
            tick: 0,
            dry_raw,
            wet_raw,
        })
    }

    fn current_raw(&self) -> u16 {
        let range = u32::from(self.wet_raw - self.dry_raw);
        let sweep = u32::from(self.tick % 64) * range / 63;
        self.dry_raw + u16::try_from(sweep).unwrap_or(u16::MAX)
    }

    fn to_percent(&self, raw: u16) -> u8 {
        if raw <= self.dry_raw {
            return 0;
        }
        if raw >= self.wet_raw {
            return 100;
        }
        let range = u32::from(self.wet_raw - self.dry_raw);
        let offset = u32::from(raw - self.dry_raw);
        let percent = offset * 100 / range;
        u8::try_from(percent.min(100)).unwrap_or(100)
    }
}

impl SensorDriver for SoilMoisture {
    fn read(&mut self, capability: &str) -> Result<serde_json::Value, DriverError> {
        self.tick = self.tick.wrapping_add(1);
        let raw = self.current_raw();
        match capability {
            "moisture" => Ok(json!(self.to_percent(raw))),
            "raw" => Ok(json!(raw)),
            other => Err(DriverError::Unsupported(other.to_owned())),
        }
    }

    fn control(&mut self, op: &str) -> Result<(), DriverError> {
        // Calibration moves the matching endpoint to the current raw
        // reading, like holding the probe in air or water.
        let raw = self.current_raw();
        match op {
            "calibrate_dry" if raw < self.wet_raw => {
                self.dry_raw = raw;
                Ok(())
            }
            "calibrate_wet" if raw > self.dry_raw => {
                self.wet_raw = raw;
                Ok(())
            }
            "calibrate_dry" | "calibrate_wet" => Err(DriverError::Write(
                "calibration points would cross".into(),
            )),
            other => Err(DriverError::Unsupported(other.to_owned())),
        }
    }

    fn control_ops(&self) -> Vec<&'static str> {
        vec!["calibrate_dry", "calibrate_wet"]
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

//! Spindle and vacuum actuation
//!
//! The motion controller's own spindle outputs are unused. Instead the spindle
//! drive takes an analog speed reference from an I2C DAC and two direction
//! lines, and the vacuum is a single relay line.
//!
//! [`ActuationShim`] owns the last commanded intent and translates it into
//! writes on an [`ActuatorOutputs`] backend. After initialization every write
//! is best-effort: failures are logged and never propagate into the job.

use millkit_core::gcode::LineActions;
use millkit_core::{ActuatorError, Result, SpindleDirection};
use millkit_settings::ActuationSettings;

/// Full-scale code of a 12-bit DAC
pub const DAC_MAX_CODE: u16 = 4095;

/// Last commanded spindle and vacuum state
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ActuationIntent {
    /// Effective spindle speed (0 when direction is Off)
    pub rpm: f64,
    /// Spindle direction
    pub direction: SpindleDirection,
    /// Vacuum relay
    pub vacuum: bool,
}

/// Raw output lines
pub trait ActuatorOutputs: Send {
    /// Drive the direction lines; at most one is ever asserted
    fn write_direction(&mut self, direction: SpindleDirection) -> Result<()>;

    /// Write the analog speed reference as a DAC code
    fn write_reference(&mut self, code: u16) -> Result<()>;

    /// Switch the vacuum relay
    fn write_vacuum(&mut self, on: bool) -> Result<()>;
}

/// Outputs that accept every call and touch no hardware
#[derive(Debug, Default)]
pub struct NoOpActuators;

impl ActuatorOutputs for NoOpActuators {
    fn write_direction(&mut self, _direction: SpindleDirection) -> Result<()> {
        Ok(())
    }

    fn write_reference(&mut self, _code: u16) -> Result<()> {
        Ok(())
    }

    fn write_vacuum(&mut self, _on: bool) -> Result<()> {
        Ok(())
    }
}

/// Linear RPM to DAC code mapping
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpindleScale {
    /// Lowest commanded speed
    pub min_rpm: f64,
    /// Speed at full-scale reference
    pub max_rpm: f64,
    /// Full-scale reference voltage
    pub vref: f64,
}

impl SpindleScale {
    /// Reference voltage for `rpm`, clamped to the configured range
    pub fn volts(&self, rpm: f64) -> f64 {
        if rpm <= 0.0 || self.max_rpm <= 0.0 {
            return 0.0;
        }
        let clamped = rpm.clamp(self.min_rpm, self.max_rpm);
        clamped / self.max_rpm * self.vref
    }

    /// 12-bit DAC code for `rpm`
    pub fn code(&self, rpm: f64) -> u16 {
        if self.vref <= 0.0 {
            return 0;
        }
        let fraction = (self.volts(rpm) / self.vref).clamp(0.0, 1.0);
        (fraction * DAC_MAX_CODE as f64).round() as u16
    }
}

impl From<&ActuationSettings> for SpindleScale {
    fn from(settings: &ActuationSettings) -> Self {
        Self {
            min_rpm: settings.spindle_min_rpm,
            max_rpm: settings.spindle_max_rpm,
            vref: settings.dac_vref,
        }
    }
}

impl Default for SpindleScale {
    fn default() -> Self {
        Self::from(&ActuationSettings::default())
    }
}

/// Owns actuation intent and drives the outputs
pub struct ActuationShim {
    outputs: Box<dyn ActuatorOutputs>,
    scale: SpindleScale,
    intent: ActuationIntent,
    setpoint_rpm: f64,
}

impl ActuationShim {
    /// Wrap an output backend
    pub fn new(outputs: Box<dyn ActuatorOutputs>, scale: SpindleScale) -> Self {
        Self {
            outputs,
            scale,
            intent: ActuationIntent::default(),
            setpoint_rpm: 0.0,
        }
    }

    /// Shim with no hardware behind it
    pub fn noop() -> Self {
        Self::new(Box::new(NoOpActuators), SpindleScale::default())
    }

    /// Build from configuration
    ///
    /// With actuation disabled this is a no-op shim. Otherwise the GPIO lines
    /// and the DAC are opened now; failure is `ActuatorUnavailable`.
    pub fn from_settings(settings: &ActuationSettings) -> Result<Self> {
        if !settings.enabled {
            tracing::info!("Actuation disabled, spindle and vacuum are no-ops");
            return Ok(Self::new(Box::new(NoOpActuators), settings.into()));
        }
        let outputs = hardware::HardwareActuators::open(settings)?;
        Ok(Self::new(Box::new(outputs), settings.into()))
    }

    /// Last commanded state
    pub fn intent(&self) -> ActuationIntent {
        self.intent
    }

    /// Last `S` value seen, kept even while the spindle is off
    pub fn setpoint_rpm(&self) -> f64 {
        self.setpoint_rpm
    }

    /// Command spindle speed and direction; `Off` forces rpm to 0
    pub fn set_spindle(&mut self, rpm: f64, direction: SpindleDirection) {
        let rpm = if rpm.is_finite() { rpm.max(0.0) } else { 0.0 };
        self.setpoint_rpm = rpm;
        let effective = match direction {
            SpindleDirection::Off => 0.0,
            _ => rpm,
        };
        self.intent.rpm = effective;
        self.intent.direction = direction;

        let code = self.scale.code(effective);
        tracing::debug!("Spindle {} at {} rpm (DAC {})", direction, effective, code);
        // Reference drops before the direction changes and rises after it.
        if direction == SpindleDirection::Off {
            self.best_effort("spindle reference", |o| o.write_reference(code));
            self.best_effort("spindle direction", |o| o.write_direction(direction));
        } else {
            self.best_effort("spindle direction", |o| o.write_direction(direction));
            self.best_effort("spindle reference", |o| o.write_reference(code));
        }
    }

    /// Change only the speed setpoint, keeping the direction
    pub fn set_rpm(&mut self, rpm: f64) {
        let direction = self.intent.direction;
        self.set_spindle(rpm, direction);
    }

    /// Switch the vacuum
    pub fn set_vacuum(&mut self, on: bool) {
        self.intent.vacuum = on;
        tracing::debug!("Vacuum {}", if on { "on" } else { "off" });
        self.best_effort("vacuum", |o| o.write_vacuum(on));
    }

    /// Apply the spindle and vacuum words of one program line
    ///
    /// `M3`/`M4` without an `S` word reuse the last setpoint; an `S` word
    /// alone changes the setpoint and keeps the direction.
    pub fn apply(&mut self, actions: &LineActions) {
        match (actions.spindle, actions.rpm) {
            (Some(direction), rpm) => {
                let rpm = rpm.unwrap_or(self.setpoint_rpm);
                self.set_spindle(rpm, direction);
            }
            (None, Some(rpm)) => self.set_rpm(rpm),
            (None, None) => {}
        }
        if let Some(on) = actions.vacuum {
            self.set_vacuum(on);
        }
    }

    /// Spindle off, vacuum off
    pub fn silence(&mut self) {
        self.set_spindle(0.0, SpindleDirection::Off);
        self.set_vacuum(false);
    }

    fn best_effort<F>(&mut self, what: &str, write: F)
    where
        F: FnOnce(&mut dyn ActuatorOutputs) -> Result<()>,
    {
        if let Err(e) = write(self.outputs.as_mut()) {
            tracing::warn!("Actuation write ({}) failed: {}", what, e);
        }
    }
}

impl std::fmt::Debug for ActuationShim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActuationShim")
            .field("scale", &self.scale)
            .field("intent", &self.intent)
            .finish()
    }
}

fn unavailable(device: impl Into<String>, reason: impl ToString) -> millkit_core::Error {
    ActuatorError::ActuatorUnavailable {
        device: device.into(),
        reason: reason.to_string(),
    }
    .into()
}

fn write_failed(device: impl Into<String>, reason: impl ToString) -> millkit_core::Error {
    ActuatorError::WriteFailed {
        device: device.into(),
        reason: reason.to_string(),
    }
    .into()
}

mod hardware {
    //! sysfs GPIO lines and an MCP4725-style DAC on `/dev/i2c-N`

    use super::{unavailable, write_failed, ActuatorOutputs};
    use millkit_core::{Result, SpindleDirection};
    use millkit_settings::ActuationSettings;
    use std::fs::{self, File, OpenOptions};
    use std::io::{Seek, SeekFrom, Write};
    use std::path::PathBuf;

    const GPIO_ROOT: &str = "/sys/class/gpio";

    struct SysfsPin {
        path: PathBuf,
        value: File,
    }

    impl SysfsPin {
        fn export(number: u32) -> Result<Self> {
            let base = PathBuf::from(format!("{}/gpio{}", GPIO_ROOT, number));
            let device = base.display().to_string();
            if !base.exists() {
                fs::write(format!("{}/export", GPIO_ROOT), number.to_string())
                    .map_err(|e| unavailable(&device, e))?;
            }
            // "low" configures an output that starts deasserted
            fs::write(base.join("direction"), "low").map_err(|e| unavailable(&device, e))?;
            let value = OpenOptions::new()
                .write(true)
                .open(base.join("value"))
                .map_err(|e| unavailable(&device, e))?;
            Ok(Self { path: base, value })
        }

        fn set(&mut self, high: bool) -> Result<()> {
            self.value
                .seek(SeekFrom::Start(0))
                .and_then(|_| self.value.write_all(if high { b"1" } else { b"0" }))
                .and_then(|_| self.value.flush())
                .map_err(|e| write_failed(self.path.display().to_string(), e))
        }
    }

    struct I2cDac {
        device: String,
        file: File,
    }

    impl I2cDac {
        #[cfg(target_os = "linux")]
        fn open(bus: u8, address: u16) -> Result<Self> {
            use std::os::unix::io::AsRawFd;

            nix::ioctl_write_int_bad!(i2c_set_slave_address, 0x0703);

            let device = format!("/dev/i2c-{}", bus);
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&device)
                .map_err(|e| unavailable(&device, e))?;
            // SAFETY: the descriptor is open for the duration of the call and
            // I2C_SLAVE takes the address by value.
            unsafe { i2c_set_slave_address(file.as_raw_fd(), address as i32) }
                .map_err(|e| unavailable(&device, e))?;
            Ok(Self { device, file })
        }

        #[cfg(not(target_os = "linux"))]
        fn open(bus: u8, _address: u16) -> Result<Self> {
            Err(unavailable(format!("/dev/i2c-{}", bus), "I2C requires Linux"))
        }

        /// MCP4725 "write DAC register" frame
        fn write_code(&mut self, code: u16) -> Result<()> {
            let code = code.min(super::DAC_MAX_CODE);
            let frame = [0x40, (code >> 4) as u8, ((code & 0x0F) << 4) as u8];
            self.file
                .write_all(&frame)
                .map_err(|e| write_failed(&self.device, e))
        }
    }

    pub(super) struct HardwareActuators {
        forward: SysfsPin,
        reverse: SysfsPin,
        vacuum: SysfsPin,
        dac: I2cDac,
    }

    impl HardwareActuators {
        pub(super) fn open(settings: &ActuationSettings) -> Result<Self> {
            let mut outputs = Self {
                forward: SysfsPin::export(settings.gpio_forward)?,
                reverse: SysfsPin::export(settings.gpio_reverse)?,
                vacuum: SysfsPin::export(settings.gpio_vacuum)?,
                dac: I2cDac::open(settings.i2c_bus, settings.dac_address)?,
            };
            outputs.dac.write_code(0)?;
            tracing::info!(
                "Actuators ready: fwd gpio{} rev gpio{} vac gpio{} dac {}@0x{:02x}",
                settings.gpio_forward,
                settings.gpio_reverse,
                settings.gpio_vacuum,
                outputs.dac.device,
                settings.dac_address
            );
            Ok(outputs)
        }
    }

    impl ActuatorOutputs for HardwareActuators {
        fn write_direction(&mut self, direction: SpindleDirection) -> Result<()> {
            // Deassert before asserting so both lines are never high together.
            match direction {
                SpindleDirection::Cw => {
                    self.reverse.set(false)?;
                    self.forward.set(true)
                }
                SpindleDirection::Ccw => {
                    self.forward.set(false)?;
                    self.reverse.set(true)
                }
                SpindleDirection::Off => {
                    self.forward.set(false)?;
                    self.reverse.set(false)
                }
            }
        }

        fn write_reference(&mut self, code: u16) -> Result<()> {
            self.dac.write_code(code)
        }

        fn write_vacuum(&mut self, on: bool) -> Result<()> {
            self.vacuum.set(on)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use millkit_core::gcode::extract_actions;
    use millkit_core::Error;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq)]
    enum Write {
        Direction(SpindleDirection),
        Reference(u16),
        Vacuum(bool),
    }

    #[derive(Clone, Default)]
    struct Recording {
        writes: Arc<Mutex<Vec<Write>>>,
        fail: bool,
    }

    impl ActuatorOutputs for Recording {
        fn write_direction(&mut self, direction: SpindleDirection) -> Result<()> {
            self.writes.lock().push(Write::Direction(direction));
            self.result()
        }

        fn write_reference(&mut self, code: u16) -> Result<()> {
            self.writes.lock().push(Write::Reference(code));
            self.result()
        }

        fn write_vacuum(&mut self, on: bool) -> Result<()> {
            self.writes.lock().push(Write::Vacuum(on));
            self.result()
        }
    }

    impl Recording {
        fn result(&self) -> Result<()> {
            if self.fail {
                Err(write_failed("test", "unplugged"))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn test_scale() {
        let scale = SpindleScale {
            min_rpm: 6000.0,
            max_rpm: 24000.0,
            vref: 5.0,
        };
        assert_eq!(scale.code(24000.0), 4095);
        assert_eq!(scale.code(12000.0), 2048);
        assert_eq!(scale.code(30000.0), 4095);
        // below min is clamped up, zero means stopped
        assert_eq!(scale.code(1000.0), scale.code(6000.0));
        assert_eq!(scale.code(0.0), 0);
        assert!((scale.volts(12000.0) - 2.5).abs() < 1e-9);
    }

    #[test]
    fn test_off_forces_zero_rpm() {
        let outputs = Recording::default();
        let mut shim = ActuationShim::new(Box::new(outputs.clone()), SpindleScale::default());
        shim.set_spindle(12000.0, SpindleDirection::Off);
        assert_eq!(shim.intent().rpm, 0.0);
        assert_eq!(shim.setpoint_rpm(), 12000.0);
        assert_eq!(
            *outputs.writes.lock(),
            vec![Write::Reference(0), Write::Direction(SpindleDirection::Off)]
        );
    }

    #[test]
    fn test_direction_before_reference_when_starting() {
        let outputs = Recording::default();
        let mut shim = ActuationShim::new(Box::new(outputs.clone()), SpindleScale::default());
        shim.set_spindle(24000.0, SpindleDirection::Ccw);
        assert_eq!(
            *outputs.writes.lock(),
            vec![Write::Direction(SpindleDirection::Ccw), Write::Reference(4095)]
        );
    }

    #[test]
    fn test_failures_are_absorbed() {
        let outputs = Recording {
            fail: true,
            ..Default::default()
        };
        let mut shim = ActuationShim::new(Box::new(outputs), SpindleScale::default());
        shim.set_spindle(10000.0, SpindleDirection::Cw);
        shim.set_vacuum(true);
        assert_eq!(shim.intent().direction, SpindleDirection::Cw);
        assert!(shim.intent().vacuum);
        shim.silence();
        assert_eq!(shim.intent(), ActuationIntent::default());
    }

    #[test]
    fn test_set_rpm_keeps_direction() {
        let mut shim = ActuationShim::noop();
        shim.set_spindle(8000.0, SpindleDirection::Cw);
        shim.set_rpm(9000.0);
        assert_eq!(shim.intent().direction, SpindleDirection::Cw);
        assert_eq!(shim.intent().rpm, 9000.0);
    }

    #[test]
    fn test_apply_line_words() {
        let mut shim = ActuationShim::noop();
        shim.apply(&extract_actions("S12000"));
        assert_eq!(shim.intent().rpm, 0.0);
        shim.apply(&extract_actions("M3"));
        assert_eq!(shim.intent().rpm, 12000.0);
        assert_eq!(shim.intent().direction, SpindleDirection::Cw);
        shim.apply(&extract_actions("M4 S8000 M8"));
        assert_eq!(shim.intent().rpm, 8000.0);
        assert!(shim.intent().vacuum);
        shim.apply(&extract_actions("M5 M9"));
        assert_eq!(shim.intent(), ActuationIntent::default());
        assert_eq!(shim.setpoint_rpm(), 8000.0);
    }

    #[test]
    fn test_enabled_without_hardware_is_unavailable() {
        let settings = ActuationSettings {
            enabled: true,
            gpio_forward: 9_999,
            i2c_bus: 250,
            ..Default::default()
        };
        match ActuationShim::from_settings(&settings) {
            Err(Error::Actuator(ActuatorError::ActuatorUnavailable { .. })) => {}
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("opening absent hardware must fail"),
        }
    }
}

//! Named, mutex-guarded parameters shared by automation and plugins.
//!
//! Readers never observe a half-written value: every access copies the value
//! in or out under the port's own lock.

use std::sync::{Arc, Mutex, PoisonError};

use crate::conversion::Conversion;
use crate::{flag_set, lock};

#[derive(Debug, Clone, PartialEq)]
pub enum PortValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f32),
    Double(f64),
    /// Buffer-valued port.
    FloatArray(Vec<f32>),
}

impl PortValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PortValue::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            PortValue::Int(v) => Some(*v as f64),
            PortValue::UInt(v) => Some(*v as f64),
            PortValue::Float(v) => Some(*v as f64),
            PortValue::Double(v) => Some(*v),
            PortValue::FloatArray(_) => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        self.as_f64().map(|v| v as f32)
    }

    /// The same variant holding `value`. Arrays are returned unchanged.
    pub fn with_scalar(&self, value: f64) -> PortValue {
        match self {
            PortValue::Bool(_) => PortValue::Bool(value >= 0.5),
            PortValue::Int(_) => PortValue::Int(value.round() as i64),
            PortValue::UInt(_) => PortValue::UInt(value.max(0.0).round() as u64),
            PortValue::Float(_) => PortValue::Float(value as f32),
            PortValue::Double(_) => PortValue::Double(value),
            PortValue::FloatArray(v) => PortValue::FloatArray(v.clone()),
        }
    }
}

flag_set!(
    PortFlags {
        /// Writes go through the conversion, reads reverse it.
        CONVERT_ALWAYS = 0;
        IS_OUTPUT = 1;
        INFINITE_RANGE = 2;
        USE_LADSPA_FLOAT = 3;
    }
);

/// One automation breakpoint at play position `x`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AutomationPoint {
    pub x: u64,
    pub value: f64,
}

#[derive(Debug)]
struct PortInner {
    value: PortValue,
    conversion: Option<Conversion>,
    automation: Vec<AutomationPoint>,
}

#[derive(Debug)]
pub struct Port {
    plugin_name: String,
    specifier: String,
    /// Position among the plugin's control ports, as `"i/n"`.
    control_port: String,
    flags: PortFlags,
    inner: Mutex<PortInner>,
}

impl Port {
    pub fn new(plugin_name: &str, specifier: &str, control_port: &str, value: PortValue) -> Self {
        Self {
            plugin_name: plugin_name.to_string(),
            specifier: specifier.to_string(),
            control_port: control_port.to_string(),
            flags: PortFlags::NONE,
            inner: Mutex::new(PortInner {
                value,
                conversion: None,
                automation: Vec::new(),
            }),
        }
    }

    pub fn with_flags(mut self, flags: PortFlags) -> Self {
        self.flags = self.flags | flags;
        self
    }

    pub fn with_conversion(mut self, conversion: Option<Conversion>) -> Self {
        self.inner
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .conversion = conversion;
        self
    }

    pub fn plugin_name(&self) -> &str {
        &self.plugin_name
    }

    pub fn specifier(&self) -> &str {
        &self.specifier
    }

    pub fn control_port(&self) -> &str {
        &self.control_port
    }

    pub fn flags(&self) -> PortFlags {
        self.flags
    }

    pub fn is_output(&self) -> bool {
        self.flags.contains(PortFlags::IS_OUTPUT)
    }

    pub fn conversion(&self) -> Option<Conversion> {
        lock(&self.inner).conversion
    }

    pub fn set_conversion(&self, conversion: Option<Conversion>) {
        lock(&self.inner).conversion = conversion;
    }

    /// The stored value, reverse-converted when the port converts always.
    pub fn safe_read(&self) -> PortValue {
        let inner = lock(&self.inner);
        match (self.flags.contains(PortFlags::CONVERT_ALWAYS), inner.conversion) {
            (true, Some(conversion)) => match inner.value.as_f64() {
                Some(v) => inner.value.with_scalar(conversion.convert(v, true)),
                None => inner.value.clone(),
            },
            _ => inner.value.clone(),
        }
    }

    /// Store `value`, forward-converting when the port converts always.
    pub fn safe_write(&self, value: PortValue) {
        let mut inner = lock(&self.inner);
        inner.value = match (self.flags.contains(PortFlags::CONVERT_ALWAYS), inner.conversion) {
            (true, Some(conversion)) => match value.as_f64() {
                Some(v) => value.with_scalar(conversion.convert(v, false)),
                None => value,
            },
            _ => value,
        };
    }

    /// The stored value as is.
    pub fn safe_read_raw(&self) -> PortValue {
        lock(&self.inner).value.clone()
    }

    pub fn safe_write_raw(&self, value: PortValue) {
        lock(&self.inner).value = value;
    }

    /// Stored value as plugin-side `f32`; arrays read as `0.0`.
    pub fn read_f32(&self) -> f32 {
        lock(&self.inner).value.as_f32().unwrap_or(0.0)
    }

    /// Store a plugin-side `f32`, keeping the port's value variant.
    pub fn write_f32(&self, value: f32) {
        let mut inner = lock(&self.inner);
        inner.value = inner.value.with_scalar(value as f64);
    }

    /// Insert an automation point, keeping points sorted by position.
    /// A point at an existing position replaces it.
    pub fn add_automation(&self, x: u64, value: f64) {
        let mut inner = lock(&self.inner);
        match inner.automation.binary_search_by_key(&x, |p| p.x) {
            Ok(i) => inner.automation[i].value = value,
            Err(i) => inner.automation.insert(i, AutomationPoint { x, value }),
        }
    }

    pub fn clear_automation(&self) {
        lock(&self.inner).automation.clear();
    }

    pub fn has_automation(&self) -> bool {
        !lock(&self.inner).automation.is_empty()
    }

    /// Automation value at `position`: linear between points, held flat
    /// before the first and after the last.
    pub fn automation_value(&self, position: u64) -> Option<f64> {
        let inner = lock(&self.inner);
        let points = &inner.automation;
        let first = points.first()?;
        let last = points.last()?;
        if position <= first.x {
            return Some(first.value);
        }
        if position >= last.x {
            return Some(last.value);
        }
        let i = points.partition_point(|p| p.x <= position);
        let (a, b) = (points[i - 1], points[i]);
        let t = (position - a.x) as f64 / (b.x - a.x) as f64;
        Some(a.value + (b.value - a.value) * t)
    }

    /// Apply automation at `position` through [`safe_write`](Self::safe_write).
    /// Returns whether a value was written.
    pub fn automate(&self, position: u64) -> bool {
        let Some(value) = self.automation_value(position) else {
            return false;
        };
        let current = self.safe_read_raw();
        self.safe_write(current.with_scalar(value));
        true
    }

    /// Find a port by specifier.
    pub fn find_specifier(ports: &[Arc<Port>], specifier: &str) -> Option<Arc<Port>> {
        ports.iter().find(|p| p.specifier == specifier).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversion::ConversionFlags;

    fn bounded_port() -> Port {
        Port::new("amp", "gain", "1/1", PortValue::Float(1.0))
            .with_flags(PortFlags::CONVERT_ALWAYS)
            .with_conversion(Some(Conversion::new(
                ConversionFlags::BOUNDED_BELOW | ConversionFlags::BOUNDED_ABOVE,
                0.0,
                2.0,
                44100,
            )))
    }

    #[test]
    fn safe_write_converts_raw_write_does_not() {
        let port = bounded_port();
        port.safe_write(PortValue::Float(5.0));
        assert_eq!(port.safe_read_raw(), PortValue::Float(2.0));
        port.safe_write_raw(PortValue::Float(5.0));
        assert_eq!(port.safe_read_raw(), PortValue::Float(5.0));
        assert_eq!(port.safe_read(), PortValue::Float(2.0));
    }

    #[test]
    fn without_convert_always_values_pass_through() {
        let port = Port::new("amp", "gain", "1/1", PortValue::Double(0.0)).with_conversion(Some(
            Conversion::new(ConversionFlags::BOUNDED_ABOVE, 0.0, 1.0, 44100),
        ));
        port.safe_write(PortValue::Double(3.0));
        assert_eq!(port.safe_read(), PortValue::Double(3.0));
    }

    #[test]
    fn write_f32_keeps_variant() {
        let port = Port::new("synth", "voices", "1/1", PortValue::Int(1));
        port.write_f32(3.6);
        assert_eq!(port.safe_read_raw(), PortValue::Int(4));
        assert_eq!(port.read_f32(), 4.0);
    }

    #[test]
    fn automation_interpolates_and_holds() {
        let port = Port::new("amp", "gain", "1/1", PortValue::Float(0.0));
        assert!(!port.automate(0));
        port.add_automation(10, 1.0);
        port.add_automation(0, 0.0);
        port.add_automation(20, 0.5);
        assert_eq!(port.automation_value(0), Some(0.0));
        assert_eq!(port.automation_value(5), Some(0.5));
        assert_eq!(port.automation_value(15), Some(0.75));
        assert_eq!(port.automation_value(99), Some(0.5));

        assert!(port.automate(5));
        assert_eq!(port.safe_read_raw(), PortValue::Float(0.5));

        port.add_automation(10, 2.0);
        assert_eq!(port.automation_value(10), Some(2.0));
        port.clear_automation();
        assert!(!port.has_automation());
    }

    #[test]
    fn automation_goes_through_conversion() {
        let port = bounded_port();
        port.add_automation(0, 10.0);
        port.automate(0);
        assert_eq!(port.safe_read_raw(), PortValue::Float(2.0));
    }

    #[test]
    fn find_port_by_specifier() {
        let ports = vec![
            Arc::new(Port::new("amp", "gain", "1/2", PortValue::Float(1.0))),
            Arc::new(Port::new("amp", "pan", "2/2", PortValue::Float(0.0))),
        ];
        let pan = Port::find_specifier(&ports, "pan").unwrap();
        assert_eq!(pan.control_port(), "2/2");
        assert!(Port::find_specifier(&ports, "drive").is_none());
    }
}

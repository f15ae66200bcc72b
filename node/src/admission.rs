use log::debug;

use crate::StartRejected;

/// Reports the free memory of the training devices.
pub trait DeviceProbe: Send + Sync {
    /// The free memory of `device` in GB, `None` if there is no such device.
    fn free_memory_gb(&self, device: usize) -> Option<f64>;
}

/// A probe reporting the same free memory for a single device, or no device at all.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedProbe {
    free_gb: Option<f64>,
}

impl FixedProbe {
    pub fn new(free_gb: f64) -> Self {
        Self {
            free_gb: Some(free_gb),
        }
    }

    /// A probe that finds no device.
    pub fn none() -> Self {
        Self { free_gb: None }
    }
}

impl DeviceProbe for FixedProbe {
    fn free_memory_gb(&self, device: usize) -> Option<f64> {
        match device {
            0 => self.free_gb,
            _ => None,
        }
    }
}

/// Checks that `device` has at least `required_gb` of free memory.
///
/// # Errors
/// `StartRejected::ResourceUnavailable` if the device is missing or short on memory.
pub fn admit(probe: &dyn DeviceProbe, device: usize, required_gb: f64) -> Result<(), StartRejected> {
    let Some(free) = probe.free_memory_gb(device) else {
        return Err(StartRejected::ResourceUnavailable(format!(
            "no device {device} available"
        )));
    };

    debug!(device = device, free_gb = free, required_gb = required_gb; "admission check");
    if free < required_gb {
        return Err(StartRejected::ResourceUnavailable(format!(
            "not enough free memory on device {device}: need at least {required_gb}GB, {free:.2}GB available"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_needs_a_device_with_enough_memory() {
        assert!(admit(&FixedProbe::new(3.0), 0, 3.0).is_ok());
        assert!(matches!(
            admit(&FixedProbe::new(2.9), 0, 3.0),
            Err(StartRejected::ResourceUnavailable(_))
        ));
        assert!(admit(&FixedProbe::none(), 0, 0.0).is_err());
        assert!(admit(&FixedProbe::new(64.0), 1, 0.0).is_err());
    }
}

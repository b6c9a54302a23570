//! The interface to the device controller driver underneath the enumerator.

use crate::gadget::{EndpointHandle, HookFailure};
use crate::usb::{DeviceAddr, EndpointAddr};

/// Operations the enumerator needs from the transport driver.
///
/// The driver owns the hardware: it moves packets, and calls back into the
/// enumerator with each SETUP packet and data stage.
pub trait Controller: Send + Sync {
    /// Adopt a new bus address. The driver must only apply it once the
    /// status stage of the current request has completed.
    fn set_address(&self, address: DeviceAddr);

    fn set_halt(&self, endpoint: EndpointAddr, halted: bool)
        -> Result<(), HookFailure>;

    fn halted(&self, endpoint: EndpointAddr) -> Result<bool, HookFailure>;

    /// Enable the endpoints of a configuration about to become active, in
    /// place of any enabled before. On failure the previous set must be
    /// left as it was.
    fn enable_endpoints(&self, endpoints: &[EndpointHandle])
        -> Result<(), HookFailure>;

    /// Disable every endpoint other than the default control endpoint.
    fn disable_endpoints(&self);
}

impl<C: Controller + ?Sized> Controller for std::sync::Arc<C> {
    fn set_address(&self, address: DeviceAddr) {
        (**self).set_address(address)
    }

    fn set_halt(&self, endpoint: EndpointAddr, halted: bool)
        -> Result<(), HookFailure>
    {
        (**self).set_halt(endpoint, halted)
    }

    fn halted(&self, endpoint: EndpointAddr) -> Result<bool, HookFailure> {
        (**self).halted(endpoint)
    }

    fn enable_endpoints(&self, endpoints: &[EndpointHandle])
        -> Result<(), HookFailure>
    {
        (**self).enable_endpoints(endpoints)
    }

    fn disable_endpoints(&self) {
        (**self).disable_endpoints()
    }
}

//! Driver-level entry points a Client driver gets for free
//!
//! [`DmfDriver::device_add`] is what `EvtDriverDeviceAdd` does for a Client
//! that only declares its Modules: hook every WDF callback table, build the
//! Module tree, and hand the device back to the host.

use alloc::{sync::Arc, vec::Vec};

use crate::{
    collection::ModuleInit,
    device::{DmfDevice, DmfDeviceInit},
    error::{Error, Result},
    sync::SpinMutex,
};

/// A Client driver built out of DMF Modules
pub trait ClientDriver: Send + Sync + 'static {
    /// Adds the device's Modules (`EvtDmfDeviceModulesAdd`)
    fn modules_add(&self, modules: &mut ModuleInit);

    /// Hands the Client's WDF callback tables to DMF.
    ///
    /// Every table has to be hooked, even with `None`.
    fn device_init(&self, device_init: &mut DmfDeviceInit) {
        device_init.hook_pnp_power_event_callbacks(None);
        device_init.hook_file_object_config(None);
        device_init.hook_power_policy_event_callbacks(None);
        device_init.hook_queue_config(None);
    }

    /// Called once the device and its Modules exist.
    ///
    /// Failing here fails the whole device add.
    #[allow(unused)]
    fn device_added(&self, device: &DmfDevice) -> Result<()> {
        Ok(())
    }

    /// Releases driver-wide resources before the driver unloads
    fn cleanup(&self) {}
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum PnpMode {
    /// Devices are added through [`DmfDriver::device_add`]
    #[default]
    Pnp,
    /// The driver creates its own control device, and never sees a device add
    NonPnp,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DriverConfig {
    pub pnp_mode: PnpMode,
}

/// The driver object of a Client driver (`DMF_DEFAULT_DRIVERENTRY`)
pub struct DmfDriver<C: ClientDriver> {
    client: C,
    config: DriverConfig,
    devices: SpinMutex<Vec<Arc<DmfDevice>>>,
}

impl<C: ClientDriver> DmfDriver<C> {
    pub fn new(client: C, config: DriverConfig) -> Self {
        log::info!("driver created ({:?})", config.pnp_mode);

        Self {
            client,
            config,
            devices: SpinMutex::new(Vec::new()),
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Devices added so far that haven't been removed
    pub fn devices(&self) -> Vec<Arc<DmfDevice>> {
        self.devices.lock().clone()
    }

    /// `DMF_DEFAULT_DEVICEADD`
    ///
    /// ## IRQL: Passive
    ///
    /// ## Errors
    ///
    /// - [`Error::InvalidDeviceState`] for a non-pnp driver, or if the Client
    ///   skipped hooking a callback table
    /// - Whatever building the Module tree or the Client's `device_added` failed with
    pub fn device_add(&self) -> Result<Arc<DmfDevice>> {
        if self.config.pnp_mode == PnpMode::NonPnp {
            log::error!("device add on a non-pnp driver");
            return Err(Error::InvalidDeviceState);
        }

        let mut device_init = DmfDeviceInit::new();
        self.client.device_init(&mut device_init);

        let device = DmfDevice::modules_create(device_init, |modules| {
            self.client.modules_add(modules)
        })
        .inspect_err(|err| log::error!("modules create failed: {err}"))?;

        // Dropping the device tears the Module tree down again
        self.client.device_added(&device)?;

        let device = Arc::new(device);
        self.devices.lock().push(device.clone());

        log::debug!("device added");
        Ok(device)
    }

    /// Cleans up a device that is being removed
    ///
    /// ## IRQL: Passive
    pub fn device_remove(&self, device: &Arc<DmfDevice>) {
        self.devices.lock().retain(|it| !Arc::ptr_eq(it, device));
        device.cleanup();
    }

    /// `DMF_DEFAULT_DRIVERCLEANUP`
    ///
    /// ## IRQL: Passive
    pub fn cleanup(&self) {
        let devices = core::mem::take(&mut *self.devices.lock());
        for device in devices.iter().rev() {
            device.cleanup();
        }

        self.client.cleanup();
        log::info!("driver cleaned up");
    }
}

//! The device a Module tree belongs to, and the WDF callbacks DMF hooks
//!
//! The Client hands its WDF callback tables to [`DmfDeviceInit`] instead of
//! registering them itself. [`DmfDevice`] then runs the Module tree's side
//! of each transition around the Client's own callback:
//!
//! - going up (prepare hardware, D0 entry) Modules go first, so the Client
//!   sees them open
//! - going down (D0 exit, release hardware) the Client goes first, while its
//!   Modules are still open

use alloc::{boxed::Box, sync::Arc, vec::Vec};

use scopeguard::ScopeGuard;

use crate::{
    attributes::{Module, ModuleAttributes, OpenStage},
    collection::{self, ModuleCollection, ModuleInit},
    error::{Error, Result},
    module::{self, CreateParams, DmfModule, DynamicModules},
    state::{ModuleState, PowerState},
    sync::SpinMutex,
};

/// Opaque identity of a file object opened on the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileObject(pub u64);

/// A device I/O control request, with its buffers already retrieved
#[derive(Debug)]
pub struct IoControlRequest<'a> {
    pub io_control_code: u32,
    pub input: &'a [u8],
    pub output: &'a mut [u8],
}

pub const METHOD_BUFFERED: u32 = 0;
pub const FILE_ANY_ACCESS: u32 = 0;
pub const FILE_READ_ACCESS: u32 = 1;
pub const FILE_WRITE_ACCESS: u32 = 2;

/// Builds an I/O control code the way `CTL_CODE` does
pub const fn ctl_code(device_type: u16, function_code: u16, method: u32, access: u32) -> u32 {
    assert!(function_code <= 0xFFF);

    ((device_type as u32) << 16)
        | ((access & 0b11) << 14)
        | ((function_code as u32) << 2)
        | (method & 0b11)
}

pub type PnpCallback = Box<dyn Fn() -> Result<()> + Send + Sync>;
pub type PowerCallback = Box<dyn Fn(PowerState) -> Result<()> + Send + Sync>;
pub type FileCallback = Box<dyn Fn(FileObject) + Send + Sync>;
pub type IoControlCallback = Box<dyn Fn(&mut IoControlRequest<'_>) -> Result<usize> + Send + Sync>;

/// The Client's `WDF_PNPPOWER_EVENT_CALLBACKS`
#[derive(Default)]
pub struct PnpPowerEventCallbacks {
    pub prepare_hardware: Option<PnpCallback>,
    pub release_hardware: Option<PnpCallback>,
    /// Receives the state the device is coming from
    pub d0_entry: Option<PowerCallback>,
    /// Receives the state the device is going to
    pub d0_exit: Option<PowerCallback>,
}

/// The Client's `WDF_FILEOBJECT_CONFIG`
#[derive(Default)]
pub struct FileObjectConfig {
    pub file_create: Option<FileCallback>,
    pub file_cleanup: Option<FileCallback>,
    pub file_close: Option<FileCallback>,
}

/// The Client's `WDF_POWER_POLICY_EVENT_CALLBACKS`
#[derive(Default)]
pub struct PowerPolicyEventCallbacks {
    pub arm_wake_from_s0: Option<PnpCallback>,
    pub disarm_wake_from_s0: Option<Box<dyn Fn() + Send + Sync>>,
    pub wake_from_s0_triggered: Option<Box<dyn Fn() + Send + Sync>>,
}

/// The Client's default `WDF_IO_QUEUE_CONFIG`
#[derive(Default)]
pub struct QueueConfig {
    pub device_io_control: Option<IoControlCallback>,
}

bitflags::bitflags! {
    /// Which callback tables the Client has handed over
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HookedTables: u8 {
        const PNP_POWER = 1 << 0;
        const FILE_OBJECT = 1 << 1;
        const POWER_POLICY = 1 << 2;
        const QUEUE = 1 << 3;
    }
}

/// Collects the Client's WDF callback tables before the device is created
/// (`PDMFDEVICE_INIT`).
///
/// Every table has to be hooked, even when the Client doesn't use that
/// feature, in which case it hooks `None`.
#[derive(Default)]
pub struct DmfDeviceInit {
    hooked: HookedTables,
    pnp_power: PnpPowerEventCallbacks,
    file_object: FileObjectConfig,
    power_policy: PowerPolicyEventCallbacks,
    queue: QueueConfig,
}

impl DmfDeviceInit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hooked(&self) -> HookedTables {
        self.hooked
    }

    /// `DMF_DmfDeviceInitHookPnpPowerEventCallbacks`
    pub fn hook_pnp_power_event_callbacks(&mut self, callbacks: Option<PnpPowerEventCallbacks>) {
        self.pnp_power = callbacks.unwrap_or_default();
        self.hooked |= HookedTables::PNP_POWER;
    }

    /// `DMF_DmfDeviceInitHookFileObjectConfig`
    pub fn hook_file_object_config(&mut self, config: Option<FileObjectConfig>) {
        self.file_object = config.unwrap_or_default();
        self.hooked |= HookedTables::FILE_OBJECT;
    }

    /// `DMF_DmfDeviceInitHookPowerPolicyEventCallbacks`
    pub fn hook_power_policy_event_callbacks(
        &mut self,
        callbacks: Option<PowerPolicyEventCallbacks>,
    ) {
        self.power_policy = callbacks.unwrap_or_default();
        self.hooked |= HookedTables::POWER_POLICY;
    }

    /// `DMF_DmfDeviceInitHookQueueConfig`
    pub fn hook_queue_config(&mut self, config: Option<QueueConfig>) {
        self.queue = config.unwrap_or_default();
        self.hooked |= HookedTables::QUEUE;
    }
}

/// A device with its Module tree attached
pub struct DmfDevice {
    modules: ModuleCollection,
    pnp_power: PnpPowerEventCallbacks,
    file_object: FileObjectConfig,
    power_policy: PowerPolicyEventCallbacks,
    queue: QueueConfig,
    /// `None` once the device has been cleaned up
    dynamic_modules: Arc<DynamicModules>,
}

static_assertions::assert_impl_all!(DmfDevice: Send, Sync);

impl DmfDevice {
    /// Builds the device's Module tree (`DMF_ModulesCreate`).
    ///
    /// `modules_add` is the Client's `EvtDmfDeviceModulesAdd`.
    ///
    /// ## IRQL: Passive
    ///
    /// ## Errors
    ///
    /// - [`Error::InvalidDeviceState`] if any of the callback tables wasn't hooked
    /// - Whatever creating or opening a `Create` Module failed with
    pub fn modules_create(
        device_init: DmfDeviceInit,
        modules_add: impl FnOnce(&mut ModuleInit),
    ) -> Result<Self> {
        let missing = HookedTables::all() - device_init.hooked;
        if !missing.is_empty() {
            log::error!("device init is missing hooks for {missing:?}");
            return Err(Error::InvalidDeviceState);
        }

        let mut init = ModuleInit::new();
        modules_add(&mut init);

        let modules = ModuleCollection::create(init)?;

        Ok(Self {
            modules,
            pnp_power: device_init.pnp_power,
            file_object: device_init.file_object,
            power_policy: device_init.power_policy,
            queue: device_init.queue,
            dynamic_modules: Arc::new(SpinMutex::new(Some(Vec::new()))),
        })
    }

    /// The device's static Module tree
    pub fn modules(&self) -> &ModuleCollection {
        &self.modules
    }

    /// Creates a Dynamic Module owned by the device, and opens it right away.
    ///
    /// Dynamic Modules don't follow the device's PnP/power transitions, so
    /// only Modules that open on creation can be dynamic.
    ///
    /// ## IRQL: Passive
    pub fn dynamic_module_create(&self, attributes: ModuleAttributes) -> Result<DmfModule> {
        if self.dynamic_modules.lock().is_none() {
            return Err(Error::InvalidDeviceState);
        }

        let create = attributes.instance_creator.ok_or(Error::InvalidParameter)?;
        let module = create(attributes, CreateParams { dynamic: true })?;
        let module = scopeguard::guard(module, |module| module.destroy());

        collection::open_stage(core::slice::from_ref(&*module), OpenStage::Create)?;

        let mut dynamic_modules = self.dynamic_modules.lock();
        let Some(dynamic_modules) = dynamic_modules.as_mut() else {
            // Lost the race against cleanup
            return Err(Error::InvalidDeviceState);
        };

        let module = ScopeGuard::into_inner(module);
        module.set_owner(&self.dynamic_modules);
        dynamic_modules.push(module.clone());

        log::debug!("{}: dynamic module created", module.name());
        Ok(module)
    }

    /// Creates a Dynamic Module of type `M` (`DMF_<Name>_Create`).
    ///
    /// Whatever Module type `attributes` were initialized for, an `M` is created.
    ///
    /// ## IRQL: Passive
    pub fn module_create<M: Module>(&self, mut attributes: ModuleAttributes) -> Result<DmfModule> {
        attributes.instance_creator = Some(module::module_create::<M>);
        self.dynamic_module_create(attributes)
    }

    /// Dynamic Modules that haven't been deleted yet
    pub fn dynamic_modules(&self) -> Vec<DmfModule> {
        self.dynamic_modules
            .lock()
            .iter()
            .flatten()
            .cloned()
            .collect()
    }

    /// `EvtDevicePrepareHardware`
    ///
    /// ## IRQL: Passive
    pub fn evt_prepare_hardware(&self) -> Result<()> {
        self.modules.prepare_hardware()?;

        if let Some(prepare_hardware) = &self.pnp_power.prepare_hardware {
            if let Err(err) = prepare_hardware() {
                log::error!("client prepare hardware failed: {err}");
                let _ = self.modules.release_hardware();
                return Err(err);
            }
        }

        Ok(())
    }

    /// `EvtDeviceReleaseHardware`
    ///
    /// ## IRQL: Passive
    pub fn evt_release_hardware(&self) -> Result<()> {
        let client = self
            .pnp_power
            .release_hardware
            .as_ref()
            .map_or(Ok(()), |release_hardware| release_hardware());

        client.and(self.modules.release_hardware())
    }

    /// `EvtDeviceD0Entry`
    ///
    /// ## IRQL: Passive
    pub fn evt_d0_entry(&self, previous_state: PowerState) -> Result<()> {
        self.modules.d0_entry(previous_state)?;

        if let Some(d0_entry) = &self.pnp_power.d0_entry {
            if let Err(err) = d0_entry(previous_state) {
                log::error!("client D0 entry failed: {err}");
                let _ = self.modules.d0_exit(previous_state);
                return Err(err);
            }
        }

        Ok(())
    }

    /// `EvtDeviceD0Exit`
    ///
    /// ## IRQL: Passive
    pub fn evt_d0_exit(&self, target_state: PowerState) -> Result<()> {
        let client = self
            .pnp_power
            .d0_exit
            .as_ref()
            .map_or(Ok(()), |d0_exit| d0_exit(target_state));

        client.and(self.modules.d0_exit(target_state))
    }

    /// `EvtIoDeviceControl` on the default queue.
    ///
    /// Modules get the first look at the request. Returns the number of
    /// bytes written to the output buffer.
    ///
    /// ## IRQL: <= Dispatch
    pub fn evt_device_io_control(&self, request: &mut IoControlRequest<'_>) -> Result<usize> {
        if let Some(result) = self.modules.device_io_control(request) {
            return result;
        }

        match &self.queue.device_io_control {
            Some(device_io_control) => device_io_control(request),
            None => {
                log::trace!(
                    "unhandled io control code {:#x}",
                    request.io_control_code
                );
                Err(Error::NotSupported)
            }
        }
    }

    /// `EvtDeviceFileCreate`
    pub fn evt_file_create(&self, file: FileObject) {
        if !self.modules.file_create(file) {
            if let Some(file_create) = &self.file_object.file_create {
                file_create(file);
            }
        }
    }

    /// `EvtFileCleanup`
    pub fn evt_file_cleanup(&self, file: FileObject) {
        if !self.modules.file_cleanup(file) {
            if let Some(file_cleanup) = &self.file_object.file_cleanup {
                file_cleanup(file);
            }
        }
    }

    /// `EvtFileClose`
    pub fn evt_file_close(&self, file: FileObject) {
        if !self.modules.file_close(file) {
            if let Some(file_close) = &self.file_object.file_close {
                file_close(file);
            }
        }
    }

    /// `EvtDeviceArmWakeFromS0`
    pub fn evt_arm_wake_from_s0(&self) -> Result<()> {
        self.power_policy
            .arm_wake_from_s0
            .as_ref()
            .map_or(Ok(()), |arm_wake_from_s0| arm_wake_from_s0())
    }

    /// `EvtDeviceDisarmWakeFromS0`
    pub fn evt_disarm_wake_from_s0(&self) {
        if let Some(disarm_wake_from_s0) = &self.power_policy.disarm_wake_from_s0 {
            disarm_wake_from_s0();
        }
    }

    /// `EvtDeviceWakeFromS0Triggered`
    pub fn evt_wake_from_s0_triggered(&self) {
        if let Some(wake_from_s0_triggered) = &self.power_policy.wake_from_s0_triggered {
            wake_from_s0_triggered();
        }
    }

    /// Destroys every remaining Dynamic Module, then the static Module tree.
    ///
    /// No Dynamic Module can be created afterwards.
    ///
    /// ## IRQL: Passive
    pub fn cleanup(&self) {
        let Some(dynamic_modules) = self.dynamic_modules.lock().take() else {
            return;
        };

        for module in dynamic_modules.iter().rev() {
            if module.state() != ModuleState::Destroyed {
                let _ = module.delete();
            }
        }

        self.modules.destroy();
        log::debug!("device cleaned up");
    }
}

impl Drop for DmfDevice {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod test {
    use std::vec;

    use super::*;
    use crate::test_modules::{CreateLeaf, D0Leaf, IoctlLeaf, PrepareLeaf, Recorder, TestConfig};

    fn hook_all(init: &mut DmfDeviceInit) {
        init.hook_pnp_power_event_callbacks(None);
        init.hook_file_object_config(None);
        init.hook_power_policy_event_callbacks(None);
        init.hook_queue_config(None);
    }

    fn recording_pnp(recorder: &Recorder) -> PnpPowerEventCallbacks {
        let (a, b, c, d) = (
            recorder.clone(),
            recorder.clone(),
            recorder.clone(),
            recorder.clone(),
        );

        PnpPowerEventCallbacks {
            prepare_hardware: Some(Box::new(move || {
                a.record("prepare_hardware", "client");
                Ok(())
            })),
            release_hardware: Some(Box::new(move || {
                b.record("release_hardware", "client");
                Ok(())
            })),
            d0_entry: Some(Box::new(move |_: PowerState| {
                c.record("d0_entry", "client");
                Ok(())
            })),
            d0_exit: Some(Box::new(move |_: PowerState| {
                d.record("d0_exit", "client");
                Ok(())
            })),
        }
    }

    #[test]
    fn assert_send_and_sync() {
        fn is_send_sync<T: Send + Sync>() {}

        is_send_sync::<DmfDevice>();
        is_send_sync::<DmfDeviceInit>();
    }

    #[test]
    fn ctl_code_layout() {
        assert_eq!(
            ctl_code(0x22, 0x800, METHOD_BUFFERED, FILE_ANY_ACCESS),
            0x0022_2000
        );
        assert_eq!(
            ctl_code(0x12, 0x200, METHOD_BUFFERED, FILE_READ_ACCESS | FILE_WRITE_ACCESS),
            0x0012_C800
        );
    }

    #[test]
    fn ctl_code_fields_stay_in_range() {
        // Largest 12-bit function code
        assert_eq!(
            ctl_code(0x22, 0xFFF, METHOD_BUFFERED, FILE_ANY_ACCESS),
            0x0022_3FFC
        );

        // Oversized method and access don't bleed into their neighbours
        assert_eq!(
            ctl_code(0x22, 0x800, 0b111, FILE_ANY_ACCESS),
            0x0022_2003
        );
        assert_eq!(
            ctl_code(0x22, 0x800, METHOD_BUFFERED, 0b110),
            0x0022_A000
        );
    }

    #[test]
    fn skipped_hook_is_an_error() {
        let mut init = DmfDeviceInit::new();
        init.hook_pnp_power_event_callbacks(None);
        init.hook_file_object_config(None);
        init.hook_queue_config(None);

        let mut modules_added = false;
        let result = DmfDevice::modules_create(init, |_| modules_added = true);

        assert_eq!(result.err(), Some(Error::InvalidDeviceState));
        assert!(!modules_added);
    }

    #[test]
    fn modules_bracket_client_callbacks() {
        let recorder = Recorder::default();
        let mut init = DmfDeviceInit::new();
        hook_all(&mut init);
        init.hook_pnp_power_event_callbacks(Some(recording_pnp(&recorder)));

        let device = DmfDevice::modules_create(init, |modules| {
            modules.module_add(PrepareLeaf::attributes(
                TestConfig::labelled("hw").recorded(&recorder),
            ));
            modules.module_add(D0Leaf::attributes(
                TestConfig::labelled("d0").recorded(&recorder),
            ));
        })
        .unwrap();

        device.evt_prepare_hardware().unwrap();
        device.evt_d0_entry(PowerState::D3Final).unwrap();
        device.evt_d0_exit(PowerState::D3).unwrap();
        device.evt_release_hardware().unwrap();

        assert_eq!(
            recorder.events(),
            vec![
                "create:hw",
                "create:d0",
                "open:hw",
                "prepare_hardware:hw",
                "prepare_hardware:client",
                "open:d0",
                "d0_entry:hw",
                "d0_entry:d0",
                "d0_entry:client",
                "d0_exit:client",
                "d0_exit:d0",
                "d0_exit:hw",
                "close:d0",
                "release_hardware:client",
                "release_hardware:hw",
                "close:hw",
            ]
        );
    }

    #[test]
    fn client_failure_rolls_back_modules() {
        let recorder = Recorder::default();
        let mut init = DmfDeviceInit::new();
        hook_all(&mut init);
        init.hook_pnp_power_event_callbacks(Some(PnpPowerEventCallbacks {
            prepare_hardware: Some(Box::new(|| Err(Error::InsufficientResources))),
            ..Default::default()
        }));

        let device = DmfDevice::modules_create(init, |modules| {
            modules.module_add(PrepareLeaf::attributes(
                TestConfig::labelled("hw").recorded(&recorder),
            ));
        })
        .unwrap();

        assert_eq!(
            device.evt_prepare_hardware(),
            Err(Error::InsufficientResources)
        );
        assert!(!device.modules().find("PrepareLeaf").unwrap().is_open());
        assert_eq!(
            recorder.events(),
            vec![
                "create:hw",
                "open:hw",
                "prepare_hardware:hw",
                "release_hardware:hw",
                "close:hw"
            ]
        );
    }

    #[test]
    fn io_control_goes_to_modules_then_client() {
        let mut init = DmfDeviceInit::new();
        hook_all(&mut init);
        init.hook_queue_config(Some(QueueConfig {
            device_io_control: Some(Box::new(|request: &mut IoControlRequest<'_>| {
                request.output[0] = 0xAA;
                Ok(1)
            })),
        }));

        let device = DmfDevice::modules_create(init, |modules| {
            modules.module_add(IoctlLeaf::attributes(TestConfig::labelled("ioctl")));
        })
        .unwrap();

        let mut output = [0u8; 2];
        let mut echo = IoControlRequest {
            io_control_code: IoctlLeaf::IOCTL_ECHO,
            input: &[5, 6],
            output: &mut output,
        };
        assert_eq!(device.evt_device_io_control(&mut echo), Ok(2));
        assert_eq!(output, [5, 6]);

        let mut output = [0u8; 1];
        let mut other = IoControlRequest {
            io_control_code: 0x1234,
            input: &[],
            output: &mut output,
        };
        assert_eq!(device.evt_device_io_control(&mut other), Ok(1));
        assert_eq!(output, [0xAA]);
    }

    #[test]
    fn unhandled_io_control_is_not_supported() {
        let mut init = DmfDeviceInit::new();
        hook_all(&mut init);
        let device = DmfDevice::modules_create(init, |_| {}).unwrap();

        let mut request = IoControlRequest {
            io_control_code: 0x1234,
            input: &[],
            output: &mut [],
        };
        assert_eq!(
            device.evt_device_io_control(&mut request),
            Err(Error::NotSupported)
        );
    }

    #[test]
    fn file_events_fall_through_to_client() {
        let recorder = Recorder::default();
        let on_create = recorder.clone();
        let mut init = DmfDeviceInit::new();
        hook_all(&mut init);
        init.hook_file_object_config(Some(FileObjectConfig {
            file_create: Some(Box::new(move |_: FileObject| {
                on_create.record("file_create", "client")
            })),
            ..Default::default()
        }));

        let device = DmfDevice::modules_create(init, |_| {}).unwrap();
        device.evt_file_create(FileObject(1));
        device.evt_file_close(FileObject(1));

        assert_eq!(recorder.events(), vec!["file_create:client"]);
    }

    #[test]
    fn dynamic_modules_live_outside_the_tree() {
        let recorder = Recorder::default();
        let mut init = DmfDeviceInit::new();
        hook_all(&mut init);
        let device = DmfDevice::modules_create(init, |_| {}).unwrap();

        // The static tree hasn't seen any PnP transition yet
        let module = device
            .dynamic_module_create(CreateLeaf::attributes(
                TestConfig::labelled("dyn").recorded(&recorder),
            ))
            .unwrap();
        assert!(module.is_open());
        assert!(module.is_dynamic());
        assert_eq!(device.dynamic_modules(), vec![module.clone()]);

        module.delete().unwrap();
        assert_eq!(module.state(), ModuleState::Destroyed);
        assert!(device.dynamic_modules().is_empty());
        assert_eq!(module.delete(), Err(Error::InvalidDeviceState));

        assert_eq!(
            recorder.events(),
            vec!["create:dyn", "open:dyn", "close:dyn"]
        );
    }

    #[test]
    fn deleted_dynamic_module_is_released() {
        let mut init = DmfDeviceInit::new();
        hook_all(&mut init);
        let device = DmfDevice::modules_create(init, |_| {}).unwrap();

        let kept = device
            .dynamic_module_create(CreateLeaf::attributes(TestConfig::labelled("kept")))
            .unwrap();
        let deleted = device
            .dynamic_module_create(CreateLeaf::attributes(TestConfig::labelled("deleted")))
            .unwrap();
        assert_eq!(deleted.handle_count(), 2);

        deleted.delete().unwrap();

        // The device no longer holds on to it
        assert_eq!(deleted.handle_count(), 1);
        assert_eq!(device.dynamic_modules(), vec![kept]);
    }

    #[test]
    fn dynamic_module_must_open_on_create() {
        let mut init = DmfDeviceInit::new();
        hook_all(&mut init);
        let device = DmfDevice::modules_create(init, |_| {}).unwrap();

        let result = device.dynamic_module_create(D0Leaf::attributes(TestConfig::labelled("d0")));
        assert_eq!(result.err(), Some(Error::InvalidParameter));
    }

    #[test]
    fn failed_dynamic_open_is_destroyed() {
        let mut init = DmfDeviceInit::new();
        hook_all(&mut init);
        let device = DmfDevice::modules_create(init, |_| {}).unwrap();

        let result = device.dynamic_module_create(CreateLeaf::attributes(
            TestConfig::labelled("dyn").failing_open(),
        ));

        assert_eq!(result.err(), Some(Error::Unsuccessful));
        assert!(device.dynamic_modules().is_empty());
    }

    #[test]
    fn cleanup_destroys_everything() {
        let recorder = Recorder::default();
        let mut init = DmfDeviceInit::new();
        hook_all(&mut init);

        let device = DmfDevice::modules_create(init, |modules| {
            modules.module_add(CreateLeaf::attributes(
                TestConfig::labelled("static").recorded(&recorder),
            ));
        })
        .unwrap();
        let dynamic = device
            .dynamic_module_create(CreateLeaf::attributes(
                TestConfig::labelled("dyn").recorded(&recorder),
            ))
            .unwrap();

        device.cleanup();

        assert_eq!(dynamic.state(), ModuleState::Destroyed);
        assert!(device.modules().modules().is_empty());
        assert_eq!(
            device
                .dynamic_module_create(CreateLeaf::attributes(TestConfig::labelled("late")))
                .err(),
            Some(Error::InvalidDeviceState)
        );
        assert_eq!(
            recorder.events(),
            vec![
                "create:static",
                "open:static",
                "create:dyn",
                "open:dyn",
                "close:dyn",
                "close:static"
            ]
        );
    }
}

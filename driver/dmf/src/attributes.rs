//! Module type descriptors, Client-facing attributes, and the [`Module`] trait

use alloc::{boxed::Box, sync::Arc};
use core::{
    any::{Any, TypeId},
    fmt,
};

use crate::{
    collection::ModuleInit,
    device::{FileObject, IoControlRequest},
    error::{Error, Result},
    module::{CreateParams, DmfModule, ModuleCreate},
    state::PowerState,
};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ModuleFlags: u32 {
        /// Created on demand, outside the device's static Module tree
        const DYNAMIC = 1 << 0;
        /// Callbacks and Methods are only called at `PASSIVE_LEVEL`
        const PASSIVE_LEVEL = 1 << 1;
        /// Implements the Transport side of an Interface
        const TRANSPORT_MODULE = 1 << 2;
        /// Wants to see device I/O control requests
        const NEEDS_DEVICE_IO_CONTROL = 1 << 3;
    }
}

/// When a Module is opened and closed relative to the owning device's
/// PnP/power transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOption {
    /// Opened as soon as the Module tree is created, closed when it is destroyed
    Create,
    /// Opened in `EvtDevicePrepareHardware`, closed in `EvtDeviceReleaseHardware`
    PrepareHardware,
    /// Opened in `EvtDeviceD0Entry`, closed in `EvtDeviceD0Exit`
    D0Entry,
    /// Registers for notification on creation, and opens itself later
    NotifyCreate,
    /// Registers for notification in `EvtDevicePrepareHardware`, and opens itself later
    NotifyPrepareHardware,
    /// Registers for notification in `EvtDeviceD0Entry`, and opens itself later
    NotifyD0Entry,
}

impl OpenOption {
    /// The device transition that triggers this option
    pub fn stage(self) -> OpenStage {
        match self {
            Self::Create | Self::NotifyCreate => OpenStage::Create,
            Self::PrepareHardware | Self::NotifyPrepareHardware => OpenStage::PrepareHardware,
            Self::D0Entry | Self::NotifyD0Entry => OpenStage::D0Entry,
        }
    }

    /// If the Module opens itself after being notified, rather than being
    /// opened by the framework
    pub fn is_notify(self) -> bool {
        matches!(
            self,
            Self::NotifyCreate | Self::NotifyPrepareHardware | Self::NotifyD0Entry
        )
    }
}

/// The device transitions Modules are opened at, in the order they happen
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OpenStage {
    Create,
    PrepareHardware,
    D0Entry,
}

/// Static metadata for a Module type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleDescriptor {
    /// Default instance name
    pub name: &'static str,
    pub open_option: OpenOption,
    pub flags: ModuleFlags,
}

impl ModuleDescriptor {
    pub const fn new(name: &'static str, open_option: OpenOption) -> Self {
        Self {
            name,
            open_option,
            flags: ModuleFlags::empty(),
        }
    }

    pub const fn with_flags(self, flags: ModuleFlags) -> Self {
        Self { flags, ..self }
    }
}

/// Identity of a config struct, checked before the config is copied into a Module
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigInfo {
    pub size: usize,
    pub type_id: TypeId,
    pub type_name: &'static str,
}

impl ConfigInfo {
    pub fn of<C: Any>() -> Self {
        Self {
            size: core::mem::size_of::<C>(),
            type_id: TypeId::of::<C>(),
            type_name: core::any::type_name::<C>(),
        }
    }
}

trait ConfigValue: Any + Send + Sync {
    fn clone_box(&self) -> Box<dyn ConfigValue>;
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any + Clone + Send + Sync> ConfigValue for T {
    fn clone_box(&self) -> Box<dyn ConfigValue> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A Client-supplied Module config, with its type erased
pub struct ModuleConfig {
    info: ConfigInfo,
    value: Box<dyn ConfigValue>,
}

impl ModuleConfig {
    pub fn new<C: Clone + Send + Sync + 'static>(config: C) -> Self {
        Self {
            info: ConfigInfo::of::<C>(),
            value: Box::new(config),
        }
    }

    pub fn info(&self) -> ConfigInfo {
        self.info
    }

    pub fn size(&self) -> usize {
        self.info.size
    }

    pub fn downcast_ref<C: 'static>(&self) -> Option<&C> {
        self.value.as_any().downcast_ref()
    }
}

impl Clone for ModuleConfig {
    fn clone(&self) -> Self {
        Self {
            info: self.info,
            value: self.value.clone_box(),
        }
    }
}

impl fmt::Debug for ModuleConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleConfig")
            .field("type", &self.info.type_name)
            .field("size", &self.info.size)
            .finish()
    }
}

pub type ModuleEventCallback = Arc<dyn Fn(&DmfModule) + Send + Sync>;

/// Client notifications about a Module it created
#[derive(Clone, Default)]
pub struct ModuleEventCallbacks {
    /// Called after the Module has opened
    pub post_open: Option<ModuleEventCallback>,
    /// Called before the Module starts closing
    pub pre_close: Option<ModuleEventCallback>,
}

impl fmt::Debug for ModuleEventCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleEventCallbacks")
            .field("post_open", &self.post_open.is_some())
            .field("pre_close", &self.pre_close.is_some())
            .finish()
    }
}

pub(crate) type InstanceCreator = fn(ModuleAttributes, CreateParams) -> Result<DmfModule>;

/// Everything a Client sets to instantiate a Module
#[derive(Clone)]
pub struct ModuleAttributes {
    /// Size of this structure as the Client saw it
    pub size_of_header: u32,
    /// Overrides the Module type's default instance name
    pub instance_name: Option<&'static str>,
    /// Size of the config the Client believes the Module takes
    pub size_of_module_specific_config: usize,
    pub config: Option<ModuleConfig>,
    pub passive_level: bool,
    pub is_transport_module: bool,
    pub callbacks: ModuleEventCallbacks,
    pub(crate) instance_creator: Option<InstanceCreator>,
}

impl fmt::Debug for ModuleAttributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleAttributes")
            .field("instance_name", &self.instance_name)
            .field(
                "size_of_module_specific_config",
                &self.size_of_module_specific_config,
            )
            .field("config", &self.config)
            .field("passive_level", &self.passive_level)
            .field("is_transport_module", &self.is_transport_module)
            .finish_non_exhaustive()
    }
}

impl ModuleAttributes {
    pub const SIZE_OF_HEADER: u32 = core::mem::size_of::<ModuleAttributes>() as u32;

    /// Blank attributes not yet tied to any Module type.
    ///
    /// Creating a Module from these fails until an instance creator is wired
    /// in by [`ModuleAttributes::for_module`].
    pub fn new(size_of_module_specific_config: usize) -> Self {
        Self {
            size_of_header: Self::SIZE_OF_HEADER,
            instance_name: None,
            size_of_module_specific_config,
            config: None,
            passive_level: false,
            is_transport_module: false,
            callbacks: ModuleEventCallbacks::default(),
            instance_creator: None,
        }
    }

    /// Attributes for a Module of type `M`, without a config
    pub fn for_module<M: Module>() -> Self {
        Self {
            instance_creator: Some(crate::module::module_create::<M>),
            ..Self::new(core::mem::size_of::<M::Config>())
        }
    }

    /// Attributes for a Module of type `M` with `config`
    pub fn config_and_attributes<M: Module>(config: M::Config) -> Self {
        Self {
            config: Some(ModuleConfig::new(config)),
            ..Self::for_module::<M>()
        }
    }

    pub fn with_instance_name(self, instance_name: &'static str) -> Self {
        Self {
            instance_name: Some(instance_name),
            ..self
        }
    }

    pub fn with_callbacks(self, callbacks: ModuleEventCallbacks) -> Self {
        Self { callbacks, ..self }
    }

    /// Checks the attributes against what `M` declares, and takes the
    /// Module's private copy of the config.
    ///
    /// Every check happens before any side effect.
    pub(crate) fn validate_config<M: Module>(&self) -> Result<M::Config> {
        if self.size_of_header != Self::SIZE_OF_HEADER {
            return Err(Error::InvalidParameter);
        }

        let expected = ConfigInfo::of::<M::Config>();
        if self.size_of_module_specific_config != expected.size {
            return Err(Error::ConfigSizeMismatch {
                expected: expected.size,
                actual: self.size_of_module_specific_config,
            });
        }

        let Some(config) = &self.config else {
            // Only config-less Modules can be created without a config
            return if expected.size == 0 {
                Ok(M::Config::default())
            } else {
                Err(Error::InvalidParameter)
            };
        };

        let actual = config.info();
        if actual.size != expected.size {
            return Err(Error::ConfigSizeMismatch {
                expected: expected.size,
                actual: actual.size,
            });
        }
        if actual.type_id != expected.type_id {
            return Err(Error::ConfigTypeMismatch {
                expected: expected.type_name,
                actual: actual.type_name,
            });
        }

        config
            .downcast_ref::<M::Config>()
            .cloned()
            .ok_or(Error::ConfigTypeMismatch {
                expected: expected.type_name,
                actual: actual.type_name,
            })
    }
}

/// A Module type.
///
/// The implementing type is the Module's private context. Every callback
/// other than [`Module::create`] is optional.
pub trait Module: Sized + Send + Sync + 'static {
    /// Client-supplied parameters, copied into the Module when it is created
    type Config: Clone + Default + Send + Sync + 'static;

    const DESCRIPTOR: ModuleDescriptor;

    /// Builds the Module's context.
    ///
    /// Child Modules have already been created and are available from
    /// `create`, which is also where Interface descriptors are declared.
    fn create(config: &Self::Config, create: &mut ModuleCreate<'_>) -> Result<Self>;

    /// Adds the child Modules this Module is composed of
    #[allow(unused)]
    fn child_modules_add(config: &Self::Config, children: &mut ModuleInit) {}

    /// Acquires resources once every child has opened
    #[allow(unused)]
    fn open(&self, module: &DmfModule) -> Result<()> {
        Ok(())
    }

    /// Releases resources before children close.
    ///
    /// In-flight references to the Module have drained by the time this is called.
    #[allow(unused)]
    fn close(&self, module: &DmfModule) {}

    /// Registers for whatever event lets a `Notify*` Module open itself
    #[allow(unused)]
    fn notification_register(&self, module: &DmfModule) -> Result<()> {
        Ok(())
    }

    #[allow(unused)]
    fn notification_unregister(&self, module: &DmfModule) {}

    #[allow(unused)]
    fn prepare_hardware(&self, module: &DmfModule) -> Result<()> {
        Ok(())
    }

    #[allow(unused)]
    fn release_hardware(&self, module: &DmfModule) -> Result<()> {
        Ok(())
    }

    #[allow(unused)]
    fn d0_entry(&self, module: &DmfModule, previous_state: PowerState) -> Result<()> {
        Ok(())
    }

    #[allow(unused)]
    fn d0_exit(&self, module: &DmfModule, target_state: PowerState) -> Result<()> {
        Ok(())
    }

    /// Offered device I/O control requests when the descriptor sets
    /// [`ModuleFlags::NEEDS_DEVICE_IO_CONTROL`].
    ///
    /// Returns `None` if the request isn't one this Module handles.
    #[allow(unused)]
    fn device_io_control(
        &self,
        module: &DmfModule,
        request: &mut IoControlRequest<'_>,
    ) -> Option<Result<usize>> {
        None
    }

    /// Returns `true` if the Module handled the file create
    #[allow(unused)]
    fn file_create(&self, module: &DmfModule, file: FileObject) -> bool {
        false
    }

    /// Returns `true` if the Module handled the file cleanup
    #[allow(unused)]
    fn file_cleanup(&self, module: &DmfModule, file: FileObject) -> bool {
        false
    }

    /// Returns `true` if the Module handled the file close
    #[allow(unused)]
    fn file_close(&self, module: &DmfModule, file: FileObject) -> bool {
        false
    }
}

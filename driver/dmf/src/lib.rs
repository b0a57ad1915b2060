//! Driver Module Framework
//!
//! Lets a driver be assembled out of self-contained Modules. The framework
//! creates each device's Module tree, opens and closes Modules in step with
//! the device's PnP/power transitions, and binds Protocol Modules to the
//! Transport Modules that implement their Interfaces.
//!
//! The host (a KMDF driver's `EvtDevice*` trampolines, or a test) drives a
//! [`DmfDevice`] through its `evt_*` entry points.
#![no_std]
#![deny(unsafe_op_in_unsafe_fn, clippy::undocumented_unsafe_blocks)]

#[cfg(any(feature = "std", test))]
extern crate std;

extern crate alloc;

pub mod attributes;
pub mod collection;
pub mod device;
pub mod driver;
pub mod error;
pub mod interface;
pub mod module;
pub mod state;
pub mod sync;

#[cfg(test)]
mod test_modules;

pub use attributes::{
    Module, ModuleAttributes, ModuleConfig, ModuleDescriptor, ModuleEventCallbacks, ModuleFlags,
    OpenOption,
};
pub use collection::{ModuleCollection, ModuleInit};
pub use device::{DmfDevice, DmfDeviceInit};
pub use driver::{ClientDriver, DmfDriver};
pub use error::{Error, Result};
pub use interface::{
    interface_bind, interface_unbind, module_interface_bind, DmfInterface, Interface,
    ProtocolDescriptor, TransportDescriptor,
};
pub use module::{DmfModule, ModuleCreate, ModuleReference};
pub use state::{InterfaceState, ModuleState, PowerState};

#[doc(hidden)]
pub mod __macro_internals {
    pub use paste::paste;
}

/// Declares the per-type entry points of a Module (`DECLARE_DMF_MODULE`)
///
/// For `declare_dmf_module!(BufferPool, BufferPoolModule)` this generates
///
/// - `dmf_buffer_pool_attributes_init()`
/// - `dmf_buffer_pool_config_and_attributes_init(config)`
/// - `dmf_buffer_pool_create(device, attributes)`, creating a Dynamic Module
#[macro_export]
macro_rules! declare_dmf_module {
    ($name:ident, $module:ty) => {
        $crate::__macro_internals::paste! {
            #[allow(dead_code)]
            pub fn [<dmf_ $name:snake _attributes_init>]() -> $crate::ModuleAttributes {
                $crate::ModuleAttributes::for_module::<$module>()
            }

            #[allow(dead_code)]
            pub fn [<dmf_ $name:snake _config_and_attributes_init>](
                config: <$module as $crate::Module>::Config,
            ) -> $crate::ModuleAttributes {
                $crate::ModuleAttributes::config_and_attributes::<$module>(config)
            }

            #[allow(dead_code)]
            pub fn [<dmf_ $name:snake _create>](
                device: &$crate::DmfDevice,
                attributes: $crate::ModuleAttributes,
            ) -> $crate::Result<$crate::DmfModule> {
                device.module_create::<$module>(attributes)
            }
        }
    };
}

//! Building the device's Module tree, and walking it through PnP/power transitions
//!
//! Transitions that open Modules walk the tree in post-order, so every child
//! opens before its parent. Transitions that close Modules walk the exact
//! reverse of that.

use alloc::vec::Vec;

use scopeguard::ScopeGuard;

use crate::{
    attributes::{ModuleAttributes, OpenStage},
    device::{FileObject, IoControlRequest},
    error::{Error, Result},
    module::{CreateParams, DmfModule},
    state::PowerState,
    sync::SpinMutex,
};

/// Modules to instantiate, in the order they were added (`DMFMODULE_INIT`)
#[derive(Debug, Default)]
pub struct ModuleInit {
    entries: Vec<ModuleAttributes>,
}

impl ModuleInit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a Module to be created (`DMF_DmfModuleAdd`)
    pub fn module_add(&mut self, attributes: ModuleAttributes) {
        self.entries.push(attributes);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Creates every Module in `init`, in order.
///
/// If one fails, the ones already created are destroyed in reverse order.
pub(crate) fn instantiate(init: ModuleInit, params: CreateParams) -> Result<Vec<DmfModule>> {
    let mut created = scopeguard::guard(
        Vec::with_capacity(init.entries.len()),
        |created: Vec<DmfModule>| {
            for module in created.iter().rev() {
                module.destroy();
            }
        },
    );

    for attributes in init.entries {
        let Some(create) = attributes.instance_creator else {
            log::error!("module attributes without an instance creator");
            return Err(Error::InvalidParameter);
        };

        created.push(create(attributes, params)?);
    }

    Ok(ScopeGuard::into_inner(created))
}

/// Every Module under `roots`, children before their parent
pub(crate) fn post_order(roots: &[DmfModule]) -> Vec<DmfModule> {
    fn visit(module: &DmfModule, order: &mut Vec<DmfModule>) {
        for child in module.children() {
            visit(&child, order);
        }
        order.push(module.clone());
    }

    let mut order = Vec::new();
    for root in roots {
        visit(root, &mut order);
    }
    order
}

enum Opened {
    Module(DmfModule),
    Registered(DmfModule),
}

/// Opens every Module under `roots` that opens at `stage`, and registers
/// every `Notify*` Module for notification.
///
/// Either everything succeeds, or whatever was opened and registered here
/// is closed and unregistered again, in reverse order.
pub(crate) fn open_stage(roots: &[DmfModule], stage: OpenStage) -> Result<()> {
    let mut opened = scopeguard::guard(Vec::new(), |opened: Vec<Opened>| {
        for undo in opened.iter().rev() {
            match undo {
                Opened::Module(module) => {
                    module.close_self();
                }
                Opened::Registered(module) => module.notification_unregister(),
            }
        }
    });

    for module in post_order(roots) {
        let option = module.open_option();
        if option.stage() != stage {
            continue;
        }

        if option.is_notify() {
            module.notification_register()?;
            opened.push(Opened::Registered(module));
        } else if module.state().is_openable() {
            module.open_self()?;
            opened.push(Opened::Module(module));
        }
    }

    ScopeGuard::into_inner(opened);
    Ok(())
}

/// Closes every Module under `roots` that was opened at `stage`, parents first.
///
/// `Notify*` Modules are unregistered before being closed, in case they
/// opened themselves in the meantime.
pub(crate) fn close_stage(roots: &[DmfModule], stage: OpenStage) {
    for module in post_order(roots).iter().rev() {
        let option = module.open_option();
        if option.stage() != stage {
            continue;
        }

        if option.is_notify() {
            module.notification_unregister();
        }
        module.close_self();
    }
}

/// The static Module tree of a device (`DMFCOLLECTION`)
pub struct ModuleCollection {
    modules: SpinMutex<Vec<DmfModule>>,
}

impl ModuleCollection {
    /// Creates every Module in `init`, then opens the `Create` ones.
    ///
    /// No half-built tree is ever left behind: on failure everything is
    /// closed and destroyed again.
    pub(crate) fn create(init: ModuleInit) -> Result<Self> {
        let modules = instantiate(init, CreateParams { dynamic: false })?;
        let modules = scopeguard::guard(modules, |modules| {
            for module in modules.iter().rev() {
                module.destroy();
            }
        });

        open_stage(&modules, OpenStage::Create)?;

        let modules = ScopeGuard::into_inner(modules);
        log::debug!("module collection created with {} modules", modules.len());

        Ok(Self {
            modules: SpinMutex::new(modules),
        })
    }

    /// The top-level Modules, in the order they were added
    pub fn modules(&self) -> Vec<DmfModule> {
        self.modules.lock().clone()
    }

    /// Finds a Module anywhere in the tree by instance name
    pub fn find(&self, name: &str) -> Option<DmfModule> {
        post_order(&self.modules())
            .into_iter()
            .find(|module| module.name() == name)
    }

    /// Opens `PrepareHardware` Modules, then offers the transition to every open Module.
    ///
    /// If a Module fails, the ones that already prepared are released again
    /// before this transition's Modules close.
    ///
    /// ## IRQL: Passive
    pub fn prepare_hardware(&self) -> Result<()> {
        let roots = self.modules();
        open_stage(&roots, OpenStage::PrepareHardware)?;

        let order = post_order(&roots);
        for (index, module) in order.iter().enumerate() {
            if let Err(err) = module.dispatch_prepare_hardware() {
                log::error!("{}: prepare hardware failed: {err}", module.name());

                for prepared in order[..index].iter().rev() {
                    let _ = prepared.dispatch_release_hardware();
                }
                close_stage(&roots, OpenStage::PrepareHardware);
                return Err(err);
            }
        }

        Ok(())
    }

    /// Offers the transition to every open Module, then closes `PrepareHardware` Modules.
    ///
    /// Every Module sees the transition even if an earlier one failed. The
    /// first failure is returned.
    ///
    /// ## IRQL: Passive
    pub fn release_hardware(&self) -> Result<()> {
        let roots = self.modules();
        let mut result = Ok(());

        for module in post_order(&roots).iter().rev() {
            if let Err(err) = module.dispatch_release_hardware() {
                log::warn!("{}: release hardware failed: {err}", module.name());
                result = result.and(Err(err));
            }
        }

        close_stage(&roots, OpenStage::PrepareHardware);
        result
    }

    /// Opens `D0Entry` Modules, then offers the transition to every open Module
    ///
    /// ## IRQL: Passive
    pub fn d0_entry(&self, previous_state: PowerState) -> Result<()> {
        let roots = self.modules();
        open_stage(&roots, OpenStage::D0Entry)?;

        let order = post_order(&roots);
        for (index, module) in order.iter().enumerate() {
            if let Err(err) = module.dispatch_d0_entry(previous_state) {
                log::error!("{}: D0 entry from {previous_state:?} failed: {err}", module.name());

                // Back to where the device came from
                for entered in order[..index].iter().rev() {
                    let _ = entered.dispatch_d0_exit(previous_state);
                }
                close_stage(&roots, OpenStage::D0Entry);
                return Err(err);
            }
        }

        Ok(())
    }

    /// Offers the transition to every open Module, then closes `D0Entry` Modules
    ///
    /// ## IRQL: Passive
    pub fn d0_exit(&self, target_state: PowerState) -> Result<()> {
        let roots = self.modules();
        let mut result = Ok(());

        for module in post_order(&roots).iter().rev() {
            if let Err(err) = module.dispatch_d0_exit(target_state) {
                log::warn!("{}: D0 exit to {target_state:?} failed: {err}", module.name());
                result = result.and(Err(err));
            }
        }

        close_stage(&roots, OpenStage::D0Entry);
        result
    }

    /// Offers an I/O control request to each interested Module in tree order.
    ///
    /// Returns `None` if no Module handled it.
    ///
    /// ## IRQL: <= Dispatch
    pub fn device_io_control(&self, request: &mut IoControlRequest<'_>) -> Option<Result<usize>> {
        post_order(&self.modules())
            .iter()
            .find_map(|module| module.dispatch_device_io_control(request))
    }

    /// Returns `true` if a Module handled the file create
    pub fn file_create(&self, file: FileObject) -> bool {
        post_order(&self.modules())
            .iter()
            .any(|module| module.dispatch_file_create(file))
    }

    /// Returns `true` if a Module handled the file cleanup
    pub fn file_cleanup(&self, file: FileObject) -> bool {
        post_order(&self.modules())
            .iter()
            .any(|module| module.dispatch_file_cleanup(file))
    }

    /// Returns `true` if a Module handled the file close
    pub fn file_close(&self, file: FileObject) -> bool {
        post_order(&self.modules())
            .iter()
            .any(|module| module.dispatch_file_close(file))
    }

    /// Closes whatever is still open, and destroys the whole tree
    ///
    /// ## IRQL: Passive
    pub fn destroy(&self) {
        let modules = core::mem::take(&mut *self.modules.lock());
        if modules.is_empty() {
            return;
        }

        for stage in [OpenStage::D0Entry, OpenStage::PrepareHardware, OpenStage::Create] {
            close_stage(&modules, stage);
        }

        for module in modules.iter().rev() {
            module.destroy();
        }

        log::debug!("module collection destroyed");
    }
}

impl Drop for ModuleCollection {
    fn drop(&mut self) {
        self.destroy();
    }
}

//! Module instances and their open/close lifecycle

use alloc::{
    boxed::Box,
    sync::{Arc, Weak},
    vec::Vec,
};
use core::{any::Any, fmt};

use rundown_ref::{RundownGuard, RundownRef};

use crate::{
    attributes::{
        Module, ModuleAttributes, ModuleDescriptor, ModuleEventCallbacks, ModuleFlags, OpenOption,
        OpenStage,
    },
    collection::{self, ModuleInit},
    device::{FileObject, IoControlRequest},
    error::{Error, Result},
    interface::{
        self, DeclaredInterface, DmfInterface, Interface, ProtocolDescriptor, TransportDescriptor,
    },
    state::{ModuleState, PowerState},
    sync::{ExecutionLevel, SpinMutex, SpinMutexGuard},
};

/// Object-safe view of a [`Module`] context
trait ModuleDispatch: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn open(&self, module: &DmfModule) -> Result<()>;
    fn close(&self, module: &DmfModule);
    fn notification_register(&self, module: &DmfModule) -> Result<()>;
    fn notification_unregister(&self, module: &DmfModule);
    fn prepare_hardware(&self, module: &DmfModule) -> Result<()>;
    fn release_hardware(&self, module: &DmfModule) -> Result<()>;
    fn d0_entry(&self, module: &DmfModule, previous_state: PowerState) -> Result<()>;
    fn d0_exit(&self, module: &DmfModule, target_state: PowerState) -> Result<()>;
    fn device_io_control(
        &self,
        module: &DmfModule,
        request: &mut IoControlRequest<'_>,
    ) -> Option<Result<usize>>;
    fn file_create(&self, module: &DmfModule, file: FileObject) -> bool;
    fn file_cleanup(&self, module: &DmfModule, file: FileObject) -> bool;
    fn file_close(&self, module: &DmfModule, file: FileObject) -> bool;
}

impl<M: Module> ModuleDispatch for M {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn open(&self, module: &DmfModule) -> Result<()> {
        <M as Module>::open(self, module)
    }

    fn close(&self, module: &DmfModule) {
        <M as Module>::close(self, module)
    }

    fn notification_register(&self, module: &DmfModule) -> Result<()> {
        <M as Module>::notification_register(self, module)
    }

    fn notification_unregister(&self, module: &DmfModule) {
        <M as Module>::notification_unregister(self, module)
    }

    fn prepare_hardware(&self, module: &DmfModule) -> Result<()> {
        <M as Module>::prepare_hardware(self, module)
    }

    fn release_hardware(&self, module: &DmfModule) -> Result<()> {
        <M as Module>::release_hardware(self, module)
    }

    fn d0_entry(&self, module: &DmfModule, previous_state: PowerState) -> Result<()> {
        <M as Module>::d0_entry(self, module, previous_state)
    }

    fn d0_exit(&self, module: &DmfModule, target_state: PowerState) -> Result<()> {
        <M as Module>::d0_exit(self, module, target_state)
    }

    fn device_io_control(
        &self,
        module: &DmfModule,
        request: &mut IoControlRequest<'_>,
    ) -> Option<Result<usize>> {
        <M as Module>::device_io_control(self, module, request)
    }

    fn file_create(&self, module: &DmfModule, file: FileObject) -> bool {
        <M as Module>::file_create(self, module, file)
    }

    fn file_cleanup(&self, module: &DmfModule, file: FileObject) -> bool {
        <M as Module>::file_cleanup(self, module, file)
    }

    fn file_close(&self, module: &DmfModule, file: FileObject) -> bool {
        <M as Module>::file_close(self, module, file)
    }
}

/// A device's Dynamic Modules, `None` once the device is cleaned up
pub(crate) type DynamicModules = SpinMutex<Option<Vec<DmfModule>>>;

/// Where in the device's object tree a Module is being created
#[derive(Debug, Clone, Copy)]
pub(crate) struct CreateParams {
    pub(crate) dynamic: bool,
}

struct ModuleObject {
    name: &'static str,
    descriptor: ModuleDescriptor,
    flags: ModuleFlags,
    execution_level: ExecutionLevel,
    /// The Module's private copy of the Client's config
    config: Box<dyn Any + Send + Sync>,
    context: Box<dyn ModuleDispatch>,
    callbacks: ModuleEventCallbacks,
    state: SpinMutex<ModuleState>,
    /// Running down whenever the Module isn't open
    rundown: RundownRef,
    /// Held by Clients through `DmfModule::lock`
    lock: SpinMutex<()>,
    parent: SpinMutex<Weak<ModuleObject>>,
    children: SpinMutex<Vec<DmfModule>>,
    declared_interfaces: Vec<DeclaredInterface>,
    bound_interfaces: SpinMutex<Vec<DmfInterface>>,
    notification_registered: SpinMutex<bool>,
    /// List a Dynamic Module removes itself from when deleted
    owner: SpinMutex<Weak<DynamicModules>>,
}

/// Opaque handle to a Module instance.
///
/// Cloning the handle doesn't extend the Module's life: once the Module is
/// destroyed every operation on any handle to it fails.
#[derive(Clone)]
pub struct DmfModule(Arc<ModuleObject>);

static_assertions::assert_impl_all!(DmfModule: Send, Sync);

impl PartialEq for DmfModule {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for DmfModule {}

impl fmt::Debug for DmfModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmfModule")
            .field("name", &self.0.name)
            .field("state", &self.state())
            .finish()
    }
}

/// Given to [`Module::create`] while the Module is being built
pub struct ModuleCreate<'a> {
    instance_name: &'static str,
    children: &'a [DmfModule],
    declared: &'a mut Vec<DeclaredInterface>,
}

impl<'a> ModuleCreate<'a> {
    pub fn instance_name(&self) -> &'static str {
        self.instance_name
    }

    /// The child Modules added by [`Module::child_modules_add`], in the order they were added
    pub fn children(&self) -> &'a [DmfModule] {
        self.children
    }

    pub fn child(&self, index: usize) -> Option<&'a DmfModule> {
        self.children.get(index)
    }

    /// Declares that this Module can be the Protocol side of `I`
    pub fn protocol_descriptor_add<I: Interface>(&mut self, descriptor: ProtocolDescriptor<I>) {
        self.declared.push(DeclaredInterface::protocol(descriptor));
    }

    /// Declares that this Module can be the Transport side of `I`
    pub fn transport_descriptor_add<I: Interface>(&mut self, descriptor: TransportDescriptor<I>) {
        self.declared.push(DeclaredInterface::transport(descriptor));
    }
}

/// Instantiates a Module of type `M`, along with all of its children.
///
/// On failure everything created so far is destroyed again.
pub(crate) fn module_create<M: Module>(
    attributes: ModuleAttributes,
    params: CreateParams,
) -> Result<DmfModule> {
    let descriptor = M::DESCRIPTOR;
    let config = attributes.validate_config::<M>()?;

    if params.dynamic && descriptor.open_option.stage() != OpenStage::Create {
        log::error!(
            "{}: dynamic modules must open on create, not {:?}",
            descriptor.name,
            descriptor.open_option
        );
        return Err(Error::InvalidParameter);
    }

    let instance_name = attributes.instance_name.unwrap_or(descriptor.name);

    let mut child_init = ModuleInit::new();
    M::child_modules_add(&config, &mut child_init);

    let children = collection::instantiate(child_init, params)?;
    let children = scopeguard::guard(children, |children| {
        for child in children.iter().rev() {
            child.destroy();
        }
    });

    // Children must be open before their parent, so a child can't be opened
    // by a later device transition than its parent
    for child in children.iter() {
        let option = child.open_option();
        if !option.is_notify() && option.stage() > descriptor.open_option.stage() {
            log::error!(
                "{instance_name}: child {} opens at {:?}, after its parent ({:?})",
                child.name(),
                option,
                descriptor.open_option
            );
            return Err(Error::InvalidParameter);
        }
    }

    let mut declared = Vec::new();
    let context = M::create(
        &config,
        &mut ModuleCreate {
            instance_name,
            children: &children,
            declared: &mut declared,
        },
    )
    .inspect_err(|err| log::error!("{instance_name}: create failed: {err}"))?;

    let children = scopeguard::ScopeGuard::into_inner(children);

    let mut flags = descriptor.flags;
    flags.set(ModuleFlags::DYNAMIC, params.dynamic);
    flags.set(
        ModuleFlags::PASSIVE_LEVEL,
        attributes.passive_level || descriptor.flags.contains(ModuleFlags::PASSIVE_LEVEL),
    );
    flags.set(
        ModuleFlags::TRANSPORT_MODULE,
        attributes.is_transport_module
            || descriptor.flags.contains(ModuleFlags::TRANSPORT_MODULE),
    );

    let execution_level = if flags.contains(ModuleFlags::PASSIVE_LEVEL) {
        ExecutionLevel::Passive
    } else {
        ExecutionLevel::Dispatch
    };

    let rundown = RundownRef::new();
    // Nothing can reference the Module until it opens
    rundown.wait_for_release();

    let object = Arc::new(ModuleObject {
        name: instance_name,
        descriptor,
        flags,
        execution_level,
        config: Box::new(config),
        context: Box::new(context),
        callbacks: attributes.callbacks,
        state: SpinMutex::new(ModuleState::Created),
        rundown,
        lock: SpinMutex::new(()),
        parent: SpinMutex::new(Weak::new()),
        children: SpinMutex::new(Vec::new()),
        declared_interfaces: declared,
        bound_interfaces: SpinMutex::new(Vec::new()),
        notification_registered: SpinMutex::new(false),
        owner: SpinMutex::new(Weak::new()),
    });

    for child in &children {
        *child.0.parent.lock() = Arc::downgrade(&object);
    }
    *object.children.lock() = children;

    log::debug!(
        "{instance_name}: created ({:?}, {:?})",
        descriptor.open_option,
        flags
    );

    Ok(DmfModule(object))
}

/// Holds a Module open until dropped (`DMF_ModuleReference`)
#[must_use = "the reference is released as soon as it is dropped"]
pub struct ModuleReference<'a> {
    module: &'a DmfModule,
    _guard: RundownGuard<'a>,
}

impl<'a> ModuleReference<'a> {
    pub fn module(&self) -> &'a DmfModule {
        self.module
    }
}

impl DmfModule {
    /// Instance name of the Module
    pub fn name(&self) -> &'static str {
        self.0.name
    }

    pub fn descriptor(&self) -> &ModuleDescriptor {
        &self.0.descriptor
    }

    pub fn open_option(&self) -> OpenOption {
        self.0.descriptor.open_option
    }

    pub fn flags(&self) -> ModuleFlags {
        self.0.flags
    }

    pub fn is_dynamic(&self) -> bool {
        self.0.flags.contains(ModuleFlags::DYNAMIC)
    }

    pub fn execution_level(&self) -> ExecutionLevel {
        self.0.execution_level
    }

    pub fn state(&self) -> ModuleState {
        *self.0.state.lock()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ModuleState::Opened
    }

    pub fn parent(&self) -> Option<DmfModule> {
        self.0.parent.lock().upgrade().map(DmfModule)
    }

    pub fn children(&self) -> Vec<DmfModule> {
        self.0.children.lock().clone()
    }

    pub fn child(&self, index: usize) -> Option<DmfModule> {
        self.0.children.lock().get(index).cloned()
    }

    /// The Module's private copy of its config
    pub fn config<C: 'static>(&self) -> Option<&C> {
        self.0.config.downcast_ref()
    }

    /// The Module's context, if it is a Module of type `M`
    pub fn context<M: Module>(&self) -> Option<&M> {
        self.0.context.as_any().downcast_ref()
    }

    /// Interfaces this Module currently takes part in
    pub fn bound_interfaces(&self) -> Vec<DmfInterface> {
        self.0.bound_interfaces.lock().clone()
    }

    /// Keeps the Module from closing while the reference is held.
    ///
    /// Fails with [`Error::InvalidDeviceState`] unless the Module is open.
    ///
    /// ## IRQL: <= Dispatch
    pub fn reference(&self) -> Result<ModuleReference<'_>> {
        let guard = self.0.rundown.acquire().ok_or(Error::InvalidDeviceState)?;

        Ok(ModuleReference {
            module: self,
            _guard: guard,
        })
    }

    /// Acquires the Module's generic lock
    ///
    /// ## IRQL: <= Dispatch
    pub fn lock(&self) -> SpinMutexGuard<'_, ()> {
        self.0.lock.lock()
    }

    /// Opens the Module (`DMF_ModuleOpen`).
    ///
    /// Used by `Notify*` Modules once whatever they were waiting for has
    /// arrived. Every child the framework opens must already be open.
    pub fn open(&self) -> Result<()> {
        self.open_self()
    }

    /// Closes the Module (`DMF_ModuleClose`).
    ///
    /// Fails with [`Error::InvalidDeviceState`] unless the Module is open.
    /// Closing a Module whose parent is still open is only allowed for
    /// `Notify*` Modules, since parents are always closed first.
    pub fn close(&self) -> Result<()> {
        self.ensure_alive()?;

        if !self.open_option().is_notify() && self.parent().is_some_and(|p| p.is_open()) {
            return Err(Error::InvalidDeviceState);
        }

        if self.close_self() {
            Ok(())
        } else {
            Err(Error::InvalidDeviceState)
        }
    }

    /// Closes and destroys a Dynamic Module, along with its children.
    ///
    /// Static Modules live as long as the device and can't be deleted.
    pub fn delete(&self) -> Result<()> {
        self.ensure_alive()?;

        if !self.is_dynamic() || self.parent().is_some() {
            return Err(Error::InvalidDeviceState);
        }

        let roots = [self.clone()];
        collection::close_stage(&roots, OpenStage::Create);
        self.destroy();

        let owner = self.0.owner.lock().upgrade();
        if let Some(owner) = owner {
            if let Some(modules) = owner.lock().as_mut() {
                modules.retain(|it| it != self);
            }
        }

        log::debug!("{}: deleted", self.name());
        Ok(())
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.state() == ModuleState::Destroyed {
            Err(Error::InvalidDeviceState)
        } else {
            Ok(())
        }
    }

    /// Moves to `next`, returning the state we came from
    fn transition(&self, next: ModuleState) -> Result<ModuleState> {
        let mut state = self.0.state.lock();
        let previous = *state;

        if !previous.can_transition_to(next) {
            return Err(Error::InvalidDeviceState);
        }

        *state = next;
        Ok(previous)
    }

    fn set_state(&self, next: ModuleState) {
        let mut state = self.0.state.lock();
        debug_assert!(
            state.can_transition_to(next),
            "{}: {:?} -> {next:?}",
            self.0.name,
            *state
        );
        *state = next;
    }

    pub(crate) fn open_self(&self) -> Result<()> {
        self.ensure_alive()?;

        let unopened_child = self
            .children()
            .into_iter()
            .find(|child| !child.open_option().is_notify() && !child.is_open());
        if let Some(child) = unopened_child {
            log::error!(
                "{}: can't open before child {} ({:?})",
                self.name(),
                child.name(),
                child.state()
            );
            return Err(Error::InvalidDeviceState);
        }

        self.transition(ModuleState::Opening)?;
        log::trace!("{}: opening", self.name());

        if let Err(err) = self.0.context.open(self) {
            log::error!("{}: open failed: {err}", self.name());
            self.set_state(ModuleState::Closed);
            return Err(err);
        }

        self.0.rundown.reinitialize();
        self.set_state(ModuleState::Opened);
        log::debug!("{}: opened", self.name());

        if let Some(post_open) = &self.0.callbacks.post_open {
            post_open(self);
        }

        Ok(())
    }

    /// Closes the Module if it is open, returning `false` if it wasn't.
    ///
    /// Unbinds every Interface the Module takes part in, then waits for
    /// outstanding references to drain before calling the Module's close.
    pub(crate) fn close_self(&self) -> bool {
        {
            let mut state = self.0.state.lock();
            if *state != ModuleState::Opened {
                return false;
            }
            *state = ModuleState::Closing;
            // Refuse new references from the moment the Module is seen closing
            self.0.rundown.begin_rundown();
        }
        log::trace!("{}: closing", self.name());

        if let Some(pre_close) = &self.0.callbacks.pre_close {
            pre_close(self);
        }

        for bound in self.bound_interfaces() {
            // Might have been unbound by the other side in the meantime
            let _ = interface::interface_unbind(&bound);
        }

        self.0.rundown.wait_for_release();
        self.0.context.close(self);

        self.set_state(ModuleState::Closed);
        log::debug!("{}: closed", self.name());
        true
    }

    pub(crate) fn notification_register(&self) -> Result<()> {
        self.ensure_alive()?;

        let mut registered = self.0.notification_registered.lock();
        if *registered {
            return Ok(());
        }
        *registered = true;
        drop(registered);

        log::trace!("{}: registering for notification", self.name());
        self.0.context.notification_register(self).inspect_err(|err| {
            log::error!("{}: notification register failed: {err}", self.name());
            *self.0.notification_registered.lock() = false;
        })
    }

    pub(crate) fn notification_unregister(&self) {
        let was_registered = core::mem::replace(&mut *self.0.notification_registered.lock(), false);

        if was_registered {
            log::trace!("{}: unregistering notification", self.name());
            self.0.context.notification_unregister(self);
        }
    }

    /// Tears down the Module and its children. The handle is dead afterwards.
    pub(crate) fn destroy(&self) {
        self.notification_unregister();
        self.close_self();

        let children = core::mem::take(&mut *self.0.children.lock());
        for child in children.iter().rev() {
            child.destroy();
        }

        let mut state = self.0.state.lock();
        if *state != ModuleState::Destroyed {
            debug_assert!(
                state.can_transition_to(ModuleState::Destroyed),
                "{}: destroyed while {:?}",
                self.0.name,
                *state
            );
            *state = ModuleState::Destroyed;
            log::trace!("{}: destroyed", self.0.name);
        }
    }

    pub(crate) fn set_owner(&self, owner: &Arc<DynamicModules>) {
        *self.0.owner.lock() = Arc::downgrade(owner);
    }

    #[cfg(test)]
    pub(crate) fn handle_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    pub(crate) fn declared_interfaces(&self) -> &[DeclaredInterface] {
        &self.0.declared_interfaces
    }

    /// Records a new binding, unless the Module has started closing.
    ///
    /// Serialized with `close_self` through the state lock, so a close
    /// either sees the binding or the binding is refused.
    pub(crate) fn interface_attach(&self, bound: &DmfInterface) -> bool {
        let state = self.0.state.lock();
        if *state != ModuleState::Opened {
            return false;
        }

        self.0.bound_interfaces.lock().push(bound.clone());
        true
    }

    pub(crate) fn interface_detach(&self, bound: &DmfInterface) {
        self.0.bound_interfaces.lock().retain(|it| it != bound);
    }

    pub(crate) fn dispatch_prepare_hardware(&self) -> Result<()> {
        let Ok(_reference) = self.reference() else {
            return Ok(());
        };
        self.0.context.prepare_hardware(self)
    }

    pub(crate) fn dispatch_release_hardware(&self) -> Result<()> {
        let Ok(_reference) = self.reference() else {
            return Ok(());
        };
        self.0.context.release_hardware(self)
    }

    pub(crate) fn dispatch_d0_entry(&self, previous_state: PowerState) -> Result<()> {
        let Ok(_reference) = self.reference() else {
            return Ok(());
        };
        self.0.context.d0_entry(self, previous_state)
    }

    pub(crate) fn dispatch_d0_exit(&self, target_state: PowerState) -> Result<()> {
        let Ok(_reference) = self.reference() else {
            return Ok(());
        };
        self.0.context.d0_exit(self, target_state)
    }

    pub(crate) fn dispatch_device_io_control(
        &self,
        request: &mut IoControlRequest<'_>,
    ) -> Option<Result<usize>> {
        if !self.0.flags.contains(ModuleFlags::NEEDS_DEVICE_IO_CONTROL) {
            return None;
        }
        let _reference = self.reference().ok()?;
        self.0.context.device_io_control(self, request)
    }

    pub(crate) fn dispatch_file_create(&self, file: FileObject) -> bool {
        self.reference()
            .is_ok_and(|_reference| self.0.context.file_create(self, file))
    }

    pub(crate) fn dispatch_file_cleanup(&self, file: FileObject) -> bool {
        self.reference()
            .is_ok_and(|_reference| self.0.context.file_cleanup(self, file))
    }

    pub(crate) fn dispatch_file_close(&self, file: FileObject) -> bool {
        self.reference()
            .is_ok_and(|_reference| self.0.context.file_close(self, file))
    }
}

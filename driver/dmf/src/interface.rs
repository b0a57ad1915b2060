//! Protocol/Transport Interface binding
//!
//! A Protocol Module consumes a capability that a Transport Module
//! implements. Both sides declare a descriptor for the same [`Interface`]
//! when they are created, and [`interface_bind`] pairs them up into a
//! [`DmfInterface`] that the Protocol calls Transport methods through.
//!
//! Binding happens in a fixed order:
//!
//! 1. The descriptors' names are checked before anything else happens.
//! 2. The Transport's bind callback receives the Protocol's bind data and
//!    returns its own.
//! 3. Only if that succeeded, both sides' `post_bind` callbacks run.
//!
//! Unbinding stops new method calls, waits for in-flight calls to drain,
//! runs both `pre_unbind` callbacks and then the Transport's unbind callback.

use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::{
    any::{Any, TypeId},
    fmt,
    ops::Deref,
};

use rundown_ref::{RundownGuard, RundownRef};

use crate::{
    error::{Error, Result},
    module::DmfModule,
    state::{InterfaceState, ModuleState},
    sync::SpinMutex,
};

/// The contract shared by a Protocol and a Transport
pub trait Interface: 'static {
    /// Name both sides' descriptors are matched by
    const NAME: &'static str;

    /// Handed from the Protocol to the Transport when binding
    type ProtocolBindData: Send + Sync + 'static;
    /// Handed back from the Transport to the Protocol when binding
    type TransportBindData: Send + Sync + 'static;

    /// Callbacks the Transport can call back into the Protocol with
    type Protocol: ?Sized + Send + Sync + 'static;
    /// Methods the Protocol calls on the Transport
    type Transport: ?Sized + Send + Sync + 'static;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceRole {
    Protocol,
    Transport,
}

pub type InterfaceCallback = Arc<dyn Fn(&DmfInterface) + Send + Sync>;

/// Header shared by Protocol and Transport descriptors
#[derive(Clone)]
pub struct InterfaceDescriptor {
    pub name: &'static str,
    pub role: InterfaceRole,
    /// Called once the Transport accepted the bind
    pub post_bind: Option<InterfaceCallback>,
    /// Called before the Transport is unbound
    pub pre_unbind: Option<InterfaceCallback>,
}

impl InterfaceDescriptor {
    pub fn new(name: &'static str, role: InterfaceRole) -> Self {
        Self {
            name,
            role,
            post_bind: None,
            pre_unbind: None,
        }
    }
}

impl fmt::Debug for InterfaceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterfaceDescriptor")
            .field("name", &self.name)
            .field("role", &self.role)
            .field("post_bind", &self.post_bind.is_some())
            .field("pre_unbind", &self.pre_unbind.is_some())
            .finish()
    }
}

/// What a Protocol Module declares for an Interface
pub struct ProtocolDescriptor<I: Interface> {
    pub header: InterfaceDescriptor,
    pub callbacks: Arc<I::Protocol>,
}

impl<I: Interface> ProtocolDescriptor<I> {
    pub fn new(callbacks: Arc<I::Protocol>) -> Self {
        Self {
            header: InterfaceDescriptor::new(I::NAME, InterfaceRole::Protocol),
            callbacks,
        }
    }

    pub fn post_bind(mut self, callback: impl Fn(&DmfInterface) + Send + Sync + 'static) -> Self {
        self.header.post_bind = Some(Arc::new(callback));
        self
    }

    pub fn pre_unbind(mut self, callback: impl Fn(&DmfInterface) + Send + Sync + 'static) -> Self {
        self.header.pre_unbind = Some(Arc::new(callback));
        self
    }
}

impl<I: Interface> Clone for ProtocolDescriptor<I> {
    fn clone(&self) -> Self {
        Self {
            header: self.header.clone(),
            callbacks: self.callbacks.clone(),
        }
    }
}

pub type TransportBindFn<I> = Arc<
    dyn Fn(
            &DmfInterface,
            &<I as Interface>::ProtocolBindData,
        ) -> Result<<I as Interface>::TransportBindData>
        + Send
        + Sync,
>;

/// What a Transport Module declares for an Interface
pub struct TransportDescriptor<I: Interface> {
    pub header: InterfaceDescriptor,
    pub transport_bind: TransportBindFn<I>,
    pub transport_unbind: Option<InterfaceCallback>,
    pub methods: Arc<I::Transport>,
}

impl<I: Interface> TransportDescriptor<I> {
    pub fn new(
        methods: Arc<I::Transport>,
        transport_bind: impl Fn(&DmfInterface, &I::ProtocolBindData) -> Result<I::TransportBindData>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            header: InterfaceDescriptor::new(I::NAME, InterfaceRole::Transport),
            transport_bind: Arc::new(transport_bind),
            transport_unbind: None,
            methods,
        }
    }

    pub fn transport_unbind(
        mut self,
        callback: impl Fn(&DmfInterface) + Send + Sync + 'static,
    ) -> Self {
        self.transport_unbind = Some(Arc::new(callback));
        self
    }

    pub fn post_bind(mut self, callback: impl Fn(&DmfInterface) + Send + Sync + 'static) -> Self {
        self.header.post_bind = Some(Arc::new(callback));
        self
    }

    pub fn pre_unbind(mut self, callback: impl Fn(&DmfInterface) + Send + Sync + 'static) -> Self {
        self.header.pre_unbind = Some(Arc::new(callback));
        self
    }
}

impl<I: Interface> Clone for TransportDescriptor<I> {
    fn clone(&self) -> Self {
        Self {
            header: self.header.clone(),
            transport_bind: self.transport_bind.clone(),
            transport_unbind: self.transport_unbind.clone(),
            methods: self.methods.clone(),
        }
    }
}

/// A descriptor a Module declared while it was created
pub(crate) struct DeclaredInterface {
    name: &'static str,
    role: InterfaceRole,
    interface_type: TypeId,
    descriptor: Box<dyn Any + Send + Sync>,
}

impl DeclaredInterface {
    pub(crate) fn protocol<I: Interface>(descriptor: ProtocolDescriptor<I>) -> Self {
        Self {
            name: descriptor.header.name,
            role: InterfaceRole::Protocol,
            interface_type: TypeId::of::<I>(),
            descriptor: Box::new(descriptor),
        }
    }

    pub(crate) fn transport<I: Interface>(descriptor: TransportDescriptor<I>) -> Self {
        Self {
            name: descriptor.header.name,
            role: InterfaceRole::Transport,
            interface_type: TypeId::of::<I>(),
            descriptor: Box::new(descriptor),
        }
    }

    /// Finds the descriptor `module` declared for `I` in `role`
    fn find<'a, I: Interface, D: 'static>(
        module: &'a DmfModule,
        role: InterfaceRole,
    ) -> Result<&'a D> {
        let declared = module
            .declared_interfaces()
            .iter()
            .find(|it| it.role == role && it.name == I::NAME)
            .ok_or(Error::InterfaceNotDeclared {
                name: I::NAME,
                module: module.name(),
            })?;

        if declared.interface_type != TypeId::of::<I>() {
            // Same name, different contract
            log::error!(
                "{}: interface {} declared with a different contract",
                module.name(),
                I::NAME
            );
            return Err(Error::InvalidParameter);
        }

        declared
            .descriptor
            .downcast_ref::<D>()
            .ok_or(Error::InvalidParameter)
    }
}

struct InterfaceObject {
    name: &'static str,
    protocol_module: DmfModule,
    transport_module: DmfModule,
    protocol_header: InterfaceDescriptor,
    transport_header: InterfaceDescriptor,
    transport_unbind: Option<InterfaceCallback>,
    /// `Arc<I::Protocol>`
    protocol_callbacks: Box<dyn Any + Send + Sync>,
    /// `Arc<I::Transport>`
    transport_methods: Box<dyn Any + Send + Sync>,
    protocol_bind_data: Arc<dyn Any + Send + Sync>,
    transport_bind_data: SpinMutex<Option<Arc<dyn Any + Send + Sync>>>,
    state: SpinMutex<InterfaceState>,
    /// Running down whenever method calls aren't allowed
    rundown: RundownRef,
}

/// Opaque handle to one Protocol-Transport binding
#[derive(Clone)]
pub struct DmfInterface(Arc<InterfaceObject>);

static_assertions::assert_impl_all!(DmfInterface: Send, Sync);

impl PartialEq for DmfInterface {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for DmfInterface {}

impl fmt::Debug for DmfInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmfInterface")
            .field("name", &self.0.name)
            .field("protocol", &self.0.protocol_module.name())
            .field("transport", &self.0.transport_module.name())
            .field("state", &self.state())
            .finish()
    }
}

/// Rundown-protected access to one side's method table.
///
/// The binding can't be torn down while this is held.
pub struct InterfaceMethods<'a, T: ?Sized> {
    methods: &'a T,
    _guard: RundownGuard<'a>,
}

impl<'a, T: ?Sized> Deref for InterfaceMethods<'a, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.methods
    }
}

impl DmfInterface {
    pub fn name(&self) -> &'static str {
        self.0.name
    }

    pub fn state(&self) -> InterfaceState {
        *self.0.state.lock()
    }

    pub fn protocol_module(&self) -> &DmfModule {
        &self.0.protocol_module
    }

    pub fn transport_module(&self) -> &DmfModule {
        &self.0.transport_module
    }

    /// The data the Protocol handed over when binding
    pub fn protocol_bind_data<I: Interface>(&self) -> Option<Arc<I::ProtocolBindData>> {
        self.0.protocol_bind_data.clone().downcast().ok()
    }

    /// The data the Transport handed back when binding
    pub fn transport_bind_data<I: Interface>(&self) -> Option<Arc<I::TransportBindData>> {
        self.0
            .transport_bind_data
            .lock()
            .clone()
            .and_then(|data| data.downcast().ok())
    }

    /// References the Transport's methods (`DMF_InterfaceReference`).
    ///
    /// Fails with [`Error::InvalidDeviceState`] once the binding is
    /// going away, and with [`Error::InvalidParameter`] if the binding
    /// isn't for `I`.
    ///
    /// ## IRQL: <= Dispatch
    pub fn transport<I: Interface>(&self) -> Result<InterfaceMethods<'_, I::Transport>> {
        let methods = self
            .0
            .transport_methods
            .downcast_ref::<Arc<I::Transport>>()
            .ok_or(Error::InvalidParameter)?;

        self.methods(&**methods)
    }

    /// References the Protocol's callbacks, for the Transport to call back into
    ///
    /// ## IRQL: <= Dispatch
    pub fn protocol<I: Interface>(&self) -> Result<InterfaceMethods<'_, I::Protocol>> {
        let callbacks = self
            .0
            .protocol_callbacks
            .downcast_ref::<Arc<I::Protocol>>()
            .ok_or(Error::InvalidParameter)?;

        self.methods(&**callbacks)
    }

    fn methods<'a, T: ?Sized>(&'a self, methods: &'a T) -> Result<InterfaceMethods<'a, T>> {
        let guard = self.0.rundown.acquire().ok_or(Error::InvalidDeviceState)?;

        Ok(InterfaceMethods {
            methods,
            _guard: guard,
        })
    }

    fn transition(&self, next: InterfaceState) -> Result<()> {
        let mut state = self.0.state.lock();

        if !state.can_transition_to(next) {
            return Err(Error::InvalidDeviceState);
        }

        *state = next;
        Ok(())
    }
}

/// Binds two Modules through the descriptors each declared for `I`
/// (`DMF_INTERFACE_BIND`).
pub fn interface_bind<I: Interface>(
    protocol_module: &DmfModule,
    transport_module: &DmfModule,
    bind_data: I::ProtocolBindData,
) -> Result<DmfInterface> {
    let protocol = DeclaredInterface::find::<I, ProtocolDescriptor<I>>(
        protocol_module,
        InterfaceRole::Protocol,
    )?;
    let transport = DeclaredInterface::find::<I, TransportDescriptor<I>>(
        transport_module,
        InterfaceRole::Transport,
    )?;

    module_interface_bind(protocol_module, transport_module, protocol, transport, bind_data)
}

/// Binds a Protocol Module to a Transport Module with explicit descriptors
/// (`DMF_ModuleInterfaceBind`).
///
/// Parameter problems are reported before either side sees a callback.
/// If the Transport refuses the bind, no `post_bind` callback runs and the
/// binding is destroyed.
pub fn module_interface_bind<I: Interface>(
    protocol_module: &DmfModule,
    transport_module: &DmfModule,
    protocol: &ProtocolDescriptor<I>,
    transport: &TransportDescriptor<I>,
    bind_data: I::ProtocolBindData,
) -> Result<DmfInterface> {
    if protocol.header.name != transport.header.name {
        log::error!(
            "interface name mismatch: protocol {} declared `{}`, transport {} declared `{}`",
            protocol_module.name(),
            protocol.header.name,
            transport_module.name(),
            transport.header.name
        );
        return Err(Error::InterfaceNameMismatch {
            protocol: protocol.header.name,
            transport: transport.header.name,
        });
    }

    if protocol.header.role != InterfaceRole::Protocol
        || transport.header.role != InterfaceRole::Transport
    {
        return Err(Error::InvalidParameter);
    }

    if protocol_module.state() != ModuleState::Opened
        || transport_module.state() != ModuleState::Opened
    {
        return Err(Error::InvalidDeviceState);
    }

    let rundown = RundownRef::new();
    // No method calls until the Transport accepts the bind
    rundown.wait_for_release();

    let bound = DmfInterface(Arc::new(InterfaceObject {
        name: protocol.header.name,
        protocol_module: protocol_module.clone(),
        transport_module: transport_module.clone(),
        protocol_header: protocol.header.clone(),
        transport_header: transport.header.clone(),
        transport_unbind: transport.transport_unbind.clone(),
        protocol_callbacks: Box::new(protocol.callbacks.clone()),
        transport_methods: Box::new(transport.methods.clone()),
        protocol_bind_data: Arc::new(bind_data),
        transport_bind_data: SpinMutex::new(None),
        state: SpinMutex::new(InterfaceState::Invalid),
        rundown,
    }));

    bound.transition(InterfaceState::Created)?;
    bound.transition(InterfaceState::Opening)?;

    let protocol_bind_data = bound
        .protocol_bind_data::<I>()
        .ok_or(Error::InvalidParameter)?;

    let transport_bind_data = match (transport.transport_bind)(&bound, &*protocol_bind_data) {
        Ok(data) => data,
        Err(err) => {
            log::error!(
                "{}: transport {} refused bind from {}: {err}",
                bound.name(),
                transport_module.name(),
                protocol_module.name()
            );
            let _ = bound.transition(InterfaceState::Destroyed);
            return Err(err);
        }
    };
    *bound.0.transport_bind_data.lock() = Some(Arc::new(transport_bind_data));

    // Methods become callable before `post_bind`, so it can issue requests
    bound.0.rundown.reinitialize();

    if let Some(post_bind) = &bound.0.protocol_header.post_bind {
        post_bind(&bound);
    }
    if let Some(post_bind) = &bound.0.transport_header.post_bind {
        post_bind(&bound);
    }

    bound.transition(InterfaceState::Opened)?;

    if !(protocol_module.interface_attach(&bound) && transport_module.interface_attach(&bound)) {
        log::warn!(
            "{}: {} or {} closed while binding",
            bound.name(),
            protocol_module.name(),
            transport_module.name()
        );
        // Might already be unbinding through the closing Module
        let _ = interface_unbind(&bound);
        return Err(Error::InvalidDeviceState);
    }

    log::debug!(
        "{}: bound {} -> {}",
        bound.name(),
        protocol_module.name(),
        transport_module.name()
    );

    Ok(bound)
}

/// Tears down a binding (`DMF_INTERFACE_UNBIND`).
///
/// Blocks until in-flight method calls have released their references, so
/// this must not be called from inside a method call on the same binding.
///
/// ## IRQL: Passive
pub fn interface_unbind(bound: &DmfInterface) -> Result<()> {
    {
        let mut state = bound.0.state.lock();
        if !state.can_transition_to(InterfaceState::Closing) {
            return Err(Error::InvalidDeviceState);
        }
        *state = InterfaceState::Closing;
        bound.0.rundown.begin_rundown();
    }

    bound.0.rundown.wait_for_release();

    if let Some(pre_unbind) = &bound.0.protocol_header.pre_unbind {
        pre_unbind(bound);
    }
    if let Some(pre_unbind) = &bound.0.transport_header.pre_unbind {
        pre_unbind(bound);
    }
    if let Some(transport_unbind) = &bound.0.transport_unbind {
        transport_unbind(bound);
    }

    bound.transition(InterfaceState::Closed)?;
    bound.0.protocol_module.interface_detach(bound);
    bound.0.transport_module.interface_detach(bound);

    log::debug!(
        "{}: unbound {} -> {}",
        bound.name(),
        bound.0.protocol_module.name(),
        bound.0.transport_module.name()
    );

    Ok(())
}

/// Every Interface a Module takes part in, in bind order
pub fn module_interfaces(module: &DmfModule) -> Vec<DmfInterface> {
    module.bound_interfaces()
}

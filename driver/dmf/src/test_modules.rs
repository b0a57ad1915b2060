//! Small Modules that record what the framework does to them

use std::{format, string::String, sync::Arc, vec::Vec};

use crate::{
    attributes::{Module, ModuleAttributes, ModuleDescriptor, ModuleFlags, OpenOption},
    collection::ModuleInit,
    device::{ctl_code, FileObject, IoControlRequest, FILE_ANY_ACCESS, METHOD_BUFFERED},
    error::{Error, Result},
    interface::{DmfInterface, Interface, ProtocolDescriptor, TransportDescriptor},
    module::{DmfModule, ModuleCreate},
    state::PowerState,
    sync::SpinMutex,
};

/// Shared log of `kind:label` events
#[derive(Clone, Default)]
pub(crate) struct Recorder(Arc<SpinMutex<Vec<String>>>);

impl Recorder {
    pub(crate) fn record(&self, kind: &str, label: &str) {
        self.0.lock().push(format!("{kind}:{label}"));
    }

    pub(crate) fn events(&self) -> Vec<String> {
        self.0.lock().clone()
    }
}

#[derive(Clone, Default)]
pub(crate) struct TestConfig {
    pub(crate) label: &'static str,
    pub(crate) recorder: Option<Recorder>,
    pub(crate) fail_create: bool,
    pub(crate) fail_open: bool,
    pub(crate) fail_transition: bool,
    pub(crate) fail_bind: bool,
    pub(crate) write_on_post_bind: bool,
    pub(crate) children: Vec<ModuleAttributes>,
}

impl TestConfig {
    pub(crate) fn labelled(label: &'static str) -> Self {
        Self {
            label,
            ..Self::default()
        }
    }

    pub(crate) fn recorded(self, recorder: &Recorder) -> Self {
        Self {
            recorder: Some(recorder.clone()),
            ..self
        }
    }

    pub(crate) fn failing_create(self) -> Self {
        Self {
            fail_create: true,
            ..self
        }
    }

    pub(crate) fn failing_open(self) -> Self {
        Self {
            fail_open: true,
            ..self
        }
    }

    /// Fails `prepare_hardware` and `d0_entry`
    pub(crate) fn failing_transition(self) -> Self {
        Self {
            fail_transition: true,
            ..self
        }
    }

    pub(crate) fn failing_bind(self) -> Self {
        Self {
            fail_bind: true,
            ..self
        }
    }

    pub(crate) fn writing_on_post_bind(self) -> Self {
        Self {
            write_on_post_bind: true,
            ..self
        }
    }

    pub(crate) fn with_child(mut self, child: ModuleAttributes) -> Self {
        self.children.push(child);
        self
    }

    fn record(&self, kind: &str) {
        if let Some(recorder) = &self.recorder {
            recorder.record(kind, self.label);
        }
    }
}

/// Behaviour shared by every test Module
pub(crate) struct Leaf {
    config: TestConfig,
    handles_files: bool,
}

impl Leaf {
    fn create<M: Module>(config: &TestConfig) -> Result<Self> {
        if config.fail_create {
            return Err(Error::InsufficientResources);
        }
        config.record("create");

        Ok(Self {
            config: config.clone(),
            handles_files: M::DESCRIPTOR
                .flags
                .contains(ModuleFlags::NEEDS_DEVICE_IO_CONTROL),
        })
    }

    pub(crate) fn label(&self) -> &'static str {
        self.config.label
    }

    fn record(&self, kind: &str) {
        self.config.record(kind);
    }

    fn open(&self) -> Result<()> {
        if self.config.fail_open {
            return Err(Error::Unsuccessful);
        }
        self.record("open");
        Ok(())
    }

    fn transition(&self, kind: &str) -> Result<()> {
        self.record(kind);
        if self.config.fail_transition {
            Err(Error::Unsuccessful)
        } else {
            Ok(())
        }
    }

    fn file_event(&self, kind: &str) -> bool {
        if self.handles_files {
            self.record(kind);
        }
        self.handles_files
    }
}

macro_rules! test_module {
    ($name:ident, $open_option:expr, $flags:expr) => {
        pub(crate) struct $name(Leaf);

        impl $name {
            pub(crate) fn attributes(config: TestConfig) -> ModuleAttributes {
                ModuleAttributes::config_and_attributes::<Self>(config)
            }

            pub(crate) fn label(&self) -> &'static str {
                self.0.label()
            }
        }

        impl Module for $name {
            type Config = TestConfig;

            const DESCRIPTOR: ModuleDescriptor =
                ModuleDescriptor::new(stringify!($name), $open_option).with_flags($flags);

            fn create(config: &TestConfig, create: &mut ModuleCreate<'_>) -> Result<Self> {
                let leaf = Leaf::create::<Self>(config)?;
                <$name>::declare_interfaces(config, create);
                Ok(Self(leaf))
            }

            fn child_modules_add(config: &TestConfig, children: &mut ModuleInit) {
                for child in &config.children {
                    children.module_add(child.clone());
                }
            }

            fn open(&self, _module: &DmfModule) -> Result<()> {
                self.0.open()
            }

            fn close(&self, _module: &DmfModule) {
                self.0.record("close");
            }

            fn notification_register(&self, _module: &DmfModule) -> Result<()> {
                self.0.record("notification_register");
                Ok(())
            }

            fn notification_unregister(&self, _module: &DmfModule) {
                self.0.record("notification_unregister");
            }

            fn prepare_hardware(&self, _module: &DmfModule) -> Result<()> {
                self.0.transition("prepare_hardware")
            }

            fn release_hardware(&self, _module: &DmfModule) -> Result<()> {
                self.0.record("release_hardware");
                Ok(())
            }

            fn d0_entry(&self, _module: &DmfModule, _previous_state: PowerState) -> Result<()> {
                self.0.transition("d0_entry")
            }

            fn d0_exit(&self, _module: &DmfModule, _target_state: PowerState) -> Result<()> {
                self.0.record("d0_exit");
                Ok(())
            }

            fn device_io_control(
                &self,
                _module: &DmfModule,
                request: &mut IoControlRequest<'_>,
            ) -> Option<Result<usize>> {
                if request.io_control_code != IoctlLeaf::IOCTL_ECHO {
                    return None;
                }

                let len = request.input.len().min(request.output.len());
                request.output[..len].copy_from_slice(&request.input[..len]);
                Some(Ok(len))
            }

            fn file_create(&self, _module: &DmfModule, _file: FileObject) -> bool {
                self.0.file_event("file_create")
            }

            fn file_cleanup(&self, _module: &DmfModule, _file: FileObject) -> bool {
                self.0.file_event("file_cleanup")
            }

            fn file_close(&self, _module: &DmfModule, _file: FileObject) -> bool {
                self.0.file_event("file_close")
            }
        }
    };
}

test_module!(CreateLeaf, OpenOption::Create, ModuleFlags::empty());
test_module!(PrepareLeaf, OpenOption::PrepareHardware, ModuleFlags::empty());
test_module!(D0Leaf, OpenOption::D0Entry, ModuleFlags::empty());
test_module!(NotifyCreateLeaf, OpenOption::NotifyCreate, ModuleFlags::empty());
test_module!(NotifyD0Leaf, OpenOption::NotifyD0Entry, ModuleFlags::empty());
test_module!(
    IoctlLeaf,
    OpenOption::Create,
    ModuleFlags::NEEDS_DEVICE_IO_CONTROL
);
test_module!(BusProtocol, OpenOption::Create, ModuleFlags::empty());
test_module!(BusTransport, OpenOption::Create, ModuleFlags::TRANSPORT_MODULE);

impl IoctlLeaf {
    pub(crate) const IOCTL_ECHO: u32 = ctl_code(0x22, 0x800, METHOD_BUFFERED, FILE_ANY_ACCESS);
}

/// Declares nothing by default
trait DeclareInterfaces {
    fn declare_interfaces(_config: &TestConfig, _create: &mut ModuleCreate<'_>) {}
}

impl DeclareInterfaces for CreateLeaf {}
impl DeclareInterfaces for PrepareLeaf {}
impl DeclareInterfaces for D0Leaf {}
impl DeclareInterfaces for NotifyCreateLeaf {}
impl DeclareInterfaces for NotifyD0Leaf {}
impl DeclareInterfaces for IoctlLeaf {}

impl DeclareInterfaces for BusProtocol {
    fn declare_interfaces(config: &TestConfig, create: &mut ModuleCreate<'_>) {
        create.protocol_descriptor_add(bus_protocol_descriptor(config));
    }
}

impl DeclareInterfaces for BusTransport {
    fn declare_interfaces(config: &TestConfig, create: &mut ModuleCreate<'_>) {
        create.transport_descriptor_add(bus_transport_descriptor(config));
    }
}

/// A bus that the Protocol writes buffers to, and that reports data back
pub(crate) struct BusTarget;

pub(crate) trait BusTargetMethods: Send + Sync {
    fn buffer_write(&self, bound: &DmfInterface, data: &[u8]) -> Result<usize>;
}

pub(crate) trait BusTargetCallbacks: Send + Sync {
    fn data_received(&self, bound: &DmfInterface, value: u32);
}

impl Interface for BusTarget {
    const NAME: &'static str = "BusTarget";

    type ProtocolBindData = u32;
    type TransportBindData = u32;

    type Protocol = dyn BusTargetCallbacks;
    type Transport = dyn BusTargetMethods;
}

/// `Dmf_BusTarget_BufferWrite`
pub(crate) fn bus_target_buffer_write(bound: &DmfInterface, data: &[u8]) -> Result<usize> {
    bound.transport::<BusTarget>()?.buffer_write(bound, data)
}

struct RecordingCallbacks(TestConfig);

impl BusTargetCallbacks for RecordingCallbacks {
    fn data_received(&self, _bound: &DmfInterface, value: u32) {
        if let Some(recorder) = &self.0.recorder {
            recorder.record("data_received", &format!("{value}"));
        }
    }
}

struct RecordingMethods(TestConfig);

impl BusTargetMethods for RecordingMethods {
    fn buffer_write(&self, _bound: &DmfInterface, data: &[u8]) -> Result<usize> {
        if let Some(recorder) = &self.0.recorder {
            recorder.record(
                "buffer_write",
                core::str::from_utf8(data).unwrap_or("<binary>"),
            );
        }
        Ok(data.len())
    }
}

pub(crate) fn bus_protocol_descriptor(config: &TestConfig) -> ProtocolDescriptor<BusTarget> {
    let callbacks: Arc<dyn BusTargetCallbacks> = Arc::new(RecordingCallbacks(config.clone()));
    let on_post_bind = config.clone();
    let on_pre_unbind = config.clone();

    ProtocolDescriptor::<BusTarget>::new(callbacks)
        .post_bind(move |bound| {
            on_post_bind.record("post_bind");
            if on_post_bind.write_on_post_bind {
                let _ = bus_target_buffer_write(bound, b"post_bind");
            }
        })
        .pre_unbind(move |_| on_pre_unbind.record("pre_unbind"))
}

pub(crate) fn bus_transport_descriptor(config: &TestConfig) -> TransportDescriptor<BusTarget> {
    let methods: Arc<dyn BusTargetMethods> = Arc::new(RecordingMethods(config.clone()));
    let on_bind = config.clone();
    let on_post_bind = config.clone();
    let on_pre_unbind = config.clone();
    let on_unbind = config.clone();

    TransportDescriptor::<BusTarget>::new(methods, move |_, protocol_data: &u32| {
        on_bind.record("transport_bind");
        if on_bind.fail_bind {
            Err(Error::Unsuccessful)
        } else {
            Ok(protocol_data * 2)
        }
    })
    .post_bind(move |_| on_post_bind.record("post_bind"))
    .pre_unbind(move |_| on_pre_unbind.record("pre_unbind"))
    .transport_unbind(move |_| on_unbind.record("transport_unbind"))
}

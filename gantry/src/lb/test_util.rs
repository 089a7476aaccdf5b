//! Shared fakes for LB policy tests: a recording helper, a controllable
//! leaf policy and a scriptable subchannel.

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex,
};

use super::{
    address::EndpointAddress, ChannelArgs, ConnectivityState, LbHelper, LbPolicy, LbPolicyArgs,
    LbUpdate, PickArgs, Picker, PolicyRegistry, Subchannel, SubchannelStateWatcher, TraceSeverity,
};
use crate::{exec::TimerDriver, Status};

pub(crate) struct RecordingHelper {
    pub(crate) timer: Arc<TimerDriver>,
    pub(crate) states: Mutex<Vec<(ConnectivityState, Status, Arc<dyn Picker>)>>,
    pub(crate) reresolutions: Mutex<usize>,
    pub(crate) subchannels: Mutex<Vec<Arc<FakeSubchannel>>>,
}

impl RecordingHelper {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            timer: TimerDriver::new(),
            states: Mutex::new(Vec::new()),
            reresolutions: Mutex::new(0),
            subchannels: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn last_state(&self) -> Option<(ConnectivityState, Status, Arc<dyn Picker>)> {
        self.states.lock().unwrap().last().cloned()
    }

    pub(crate) fn last_picker(&self) -> Option<Arc<dyn Picker>> {
        self.last_state().map(|(_, _, picker)| picker)
    }
}

impl LbHelper for RecordingHelper {
    fn create_subchannel(
        &self,
        address: &EndpointAddress,
        _args: &ChannelArgs,
    ) -> Arc<dyn Subchannel> {
        let subchannel = Arc::new(FakeSubchannel::new(address.clone()));
        self.subchannels.lock().unwrap().push(subchannel.clone());
        subchannel
    }

    fn update_state(&self, state: ConnectivityState, status: Status, picker: Arc<dyn Picker>) {
        self.states.lock().unwrap().push((state, status, picker));
    }

    fn request_reresolution(&self) {
        *self.reresolutions.lock().unwrap() += 1;
    }

    fn add_trace_event(&self, _severity: TraceSeverity, _message: &str) {}

    fn event_engine(&self) -> Arc<TimerDriver> {
        self.timer.clone()
    }
}

pub(crate) struct FakeSubchannel {
    address: EndpointAddress,
    pub(crate) connect_calls: AtomicUsize,
    watchers: Mutex<Vec<Arc<dyn SubchannelStateWatcher>>>,
}

impl FakeSubchannel {
    pub(crate) fn new(address: EndpointAddress) -> Self {
        Self {
            address,
            connect_calls: AtomicUsize::new(0),
            watchers: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn report_state(&self, state: ConnectivityState, status: Status) {
        let watchers = self.watchers.lock().unwrap().clone();
        for watcher in watchers {
            watcher.on_state_change(state, status.clone());
        }
    }
}

impl Subchannel for FakeSubchannel {
    fn connect(&self) {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn address(&self) -> EndpointAddress {
        self.address.clone()
    }

    fn add_watcher(&self, watcher: Arc<dyn SubchannelStateWatcher>) {
        self.watchers.lock().unwrap().push(watcher);
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// A picker distinguishable by identity; returns a fixed result.
pub(crate) struct TagPicker(pub(crate) &'static str);

impl Picker for TagPicker {
    fn pick(&self, _args: &PickArgs<'_>) -> super::PickResult {
        super::PickResult::Fail(Status::unavailable(self.0))
    }
}

/// Remote control for one [`LeafPolicy`] instance.
#[derive(Default)]
pub(crate) struct LeafControl {
    helper: Mutex<Option<Arc<dyn LbHelper>>>,
    pub(crate) addresses: Mutex<Vec<EndpointAddress>>,
    pub(crate) channel_args: Mutex<Option<ChannelArgs>>,
    pub(crate) was_shutdown: AtomicBool,
}

impl LeafControl {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn is_attached(&self) -> bool {
        self.helper.lock().unwrap().is_some()
    }

    pub(crate) fn report(
        &self,
        state: ConnectivityState,
        status: Status,
        picker: Arc<dyn Picker>,
    ) {
        let helper = self
            .helper
            .lock()
            .unwrap()
            .clone()
            .expect("leaf policy not attached");
        helper.update_state(state, status, picker);
    }

    /// Create a subchannel through the leaf's helper chain, so parent
    /// policies get the chance to wrap it.
    pub(crate) fn create_subchannel(&self, address: &EndpointAddress) -> Arc<dyn Subchannel> {
        let helper = self
            .helper
            .lock()
            .unwrap()
            .clone()
            .expect("leaf policy not attached");
        helper.create_subchannel(address, &ChannelArgs::new())
    }
}

/// Picker handing every pick to one fixed subchannel.
pub(crate) struct CompletePicker(pub(crate) Arc<dyn Subchannel>);

impl Picker for CompletePicker {
    fn pick(&self, _args: &PickArgs<'_>) -> super::PickResult {
        super::PickResult::Complete {
            subchannel: self.0.clone(),
            tracker: None,
        }
    }
}

/// Config consumed by [`LeafPolicy`]: binds the instance to a control.
pub(crate) struct LeafConfig {
    pub(crate) control: Arc<LeafControl>,
}

pub(crate) const LEAF_POLICY_NAME: &str = "leaf_for_tests";

struct LeafPolicy {
    helper: Arc<dyn LbHelper>,
    control: Mutex<Option<Arc<LeafControl>>>,
}

impl LbPolicy for LeafPolicy {
    fn name(&self) -> &'static str {
        LEAF_POLICY_NAME
    }

    fn update(&self, update: LbUpdate) -> Result<(), Status> {
        let config = update
            .config
            .and_then(|c| c.downcast::<LeafConfig>().ok())
            .ok_or_else(|| Status::invalid_argument("missing leaf config"))?;
        *config.control.helper.lock().unwrap() = Some(self.helper.clone());
        *config.control.addresses.lock().unwrap() = update.addresses.unwrap_or_default();
        *config.control.channel_args.lock().unwrap() = Some(update.args);
        *self.control.lock().unwrap() = Some(config.control.clone());
        Ok(())
    }

    fn exit_idle(&self) {}

    fn reset_backoff(&self) {}

    fn shutdown(&self) {
        if let Some(control) = self.control.lock().unwrap().clone() {
            control.was_shutdown.store(true, Ordering::SeqCst);
        }
    }
}

pub(crate) fn register_leaf(registry: &PolicyRegistry) {
    registry.register(
        LEAF_POLICY_NAME,
        std::sync::Arc::new(|args: LbPolicyArgs| {
            Arc::new(LeafPolicy {
                helper: args.helper,
                control: Mutex::new(None),
            }) as Arc<dyn LbPolicy>
        }),
    );
}

//! The hierarchical load-balancing core: policy and picker contracts,
//! address filtering, the graceful-switch child handler, priority
//! failover, circuit breaking, xDS cluster wrapping and stateful-session
//! host pinning.

pub mod address;
pub mod child_handler;
#[cfg(test)]
pub(crate) mod test_util;
pub mod circuit;
pub mod cluster;
pub mod override_host;
pub mod priority;

use std::{
    any::{Any, TypeId},
    sync::{Arc, Mutex},
};

use rustc_hash::FxHashMap;

use crate::{
    exec::{TimerDriver, WorkSerializer},
    Status,
};
use self::address::EndpointAddress;

/// Channel connectivity, as aggregated by policies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectivityState {
    /// No connection and none wanted yet.
    Idle,
    /// Connection attempt in flight.
    Connecting,
    /// Usable.
    Ready,
    /// Recent failures; backing off.
    TransientFailure,
}

/// Severity of a channel trace event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum TraceSeverity {
    Info,
    Warning,
    Error,
}

/// Outcome of a completed call, fed back to its tracker.
#[derive(Clone, Debug, Default)]
pub struct CallResult {
    /// Whether the call failed.
    pub failed: bool,
    /// Backend metric data extracted from the response.
    pub named_metrics: Vec<(String, f64)>,
}

/// Observes the calls routed through a picked subchannel.
pub trait CallTracker: Send + Sync {
    /// The call was started on the subchannel.
    fn start(&self);
    /// The call finished.
    fn finish(&self, result: &CallResult);
}

/// Result of a pick. Never suspends; queued picks are retried when a new
/// picker is published.
pub enum PickResult {
    /// Route the call to `subchannel`.
    Complete {
        /// The chosen subchannel.
        subchannel: Arc<dyn Subchannel>,
        /// Optional per-call observer.
        tracker: Option<Arc<dyn CallTracker>>,
    },
    /// No decision yet; retry on the next picker update.
    Queue,
    /// Fail the call; it may be retried elsewhere.
    Fail(Status),
    /// Drop the call; never retried at this layer.
    Drop(Status),
}

/// Typemap of per-call attributes carried by [`PickArgs`].
#[derive(Clone, Default)]
pub struct CallAttributes {
    map: FxHashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl CallAttributes {
    /// Empty attribute set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install an attribute, replacing any previous value of the type.
    pub fn set<T: Any + Send + Sync>(&mut self, value: Arc<T>) {
        self.map.insert(TypeId::of::<T>(), value);
    }

    /// Fetch an attribute by type.
    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.map
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|any| any.downcast::<T>().ok())
    }
}

/// Arguments to a pick.
pub struct PickArgs<'a> {
    /// Per-call attributes (for example the stateful-session cookie).
    pub attributes: &'a CallAttributes,
}

/// An immutable routing snapshot. Picks run on arbitrary threads.
pub trait Picker: Send + Sync {
    /// Route one call.
    fn pick(&self, args: &PickArgs<'_>) -> PickResult;
}

/// Picker that queues every pick (no decision yet).
pub struct QueuePicker;

impl Picker for QueuePicker {
    fn pick(&self, _args: &PickArgs<'_>) -> PickResult {
        PickResult::Queue
    }
}

/// Picker that fails every pick with a fixed status.
pub struct FailingPicker(pub Status);

impl Picker for FailingPicker {
    fn pick(&self, _args: &PickArgs<'_>) -> PickResult {
        PickResult::Fail(self.0.clone())
    }
}

/// Watches a subchannel's connectivity.
pub trait SubchannelStateWatcher: Send + Sync {
    /// The subchannel transitioned to `state`.
    fn on_state_change(&self, state: ConnectivityState, status: Status);
}

/// A connection (or potential connection) to one address.
pub trait Subchannel: Send + Sync {
    /// Ask the subchannel to establish a transport.
    fn connect(&self);
    /// The address this subchannel dials.
    fn address(&self) -> EndpointAddress;
    /// Register a state watcher.
    fn add_watcher(&self, watcher: Arc<dyn SubchannelStateWatcher>);
    /// Downcast support for wrappers.
    fn as_any(&self) -> &dyn Any;
}

/// Typemap of channel-level arguments flowing down the policy tree.
#[derive(Clone, Default)]
pub struct ChannelArgs {
    map: FxHashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl ChannelArgs {
    /// Empty argument set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install an argument, replacing any previous value of the type.
    pub fn set<T: Any + Send + Sync>(&mut self, value: Arc<T>) {
        self.map.insert(TypeId::of::<T>(), value);
    }

    /// Fetch an argument by type.
    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.map
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|any| any.downcast::<T>().ok())
    }
}

/// A resolver update delivered to a policy.
#[derive(Clone)]
pub struct LbUpdate {
    /// Resolved addresses, or the resolver's error.
    pub addresses: Result<Vec<EndpointAddress>, Status>,
    /// Policy-specific parsed configuration.
    pub config: Option<Arc<dyn Any + Send + Sync>>,
    /// Human-readable note about this resolution pass.
    pub resolution_note: String,
    /// Channel arguments for subchannel creation.
    pub args: ChannelArgs,
}

impl LbUpdate {
    /// An update carrying just `addresses`.
    pub fn with_addresses(addresses: Vec<EndpointAddress>) -> Self {
        Self {
            addresses: Ok(addresses),
            config: None,
            resolution_note: String::new(),
            args: ChannelArgs::new(),
        }
    }
}

/// The capability set every load-balancing policy exposes.
pub trait LbPolicy: Send + Sync {
    /// Registry name of the policy.
    fn name(&self) -> &'static str;
    /// Apply a resolver update.
    fn update(&self, update: LbUpdate) -> Result<(), Status>;
    /// Leave the idle state.
    fn exit_idle(&self);
    /// Reset connection backoff.
    fn reset_backoff(&self);
    /// Tear down; no further callbacks may be emitted.
    fn shutdown(&self);
}

/// The capability set a policy's owner provides to it.
pub trait LbHelper: Send + Sync {
    /// Create a subchannel for `address`.
    fn create_subchannel(
        &self,
        address: &EndpointAddress,
        args: &ChannelArgs,
    ) -> Arc<dyn Subchannel>;
    /// Publish aggregated state and a new picker.
    fn update_state(&self, state: ConnectivityState, status: Status, picker: Arc<dyn Picker>);
    /// Ask the resolver to re-resolve.
    fn request_reresolution(&self);
    /// Record a channel trace event.
    fn add_trace_event(&self, severity: TraceSeverity, message: &str);
    /// The timer surface for this channel.
    fn event_engine(&self) -> Arc<TimerDriver>;
}

/// Everything a policy needs at construction.
#[derive(Clone)]
pub struct LbPolicyArgs {
    /// The owner's helper.
    pub helper: Arc<dyn LbHelper>,
    /// The channel's work serializer.
    pub serializer: Arc<WorkSerializer>,
    /// Registry for instantiating child policies.
    pub registry: Arc<PolicyRegistry>,
}

/// Selects a child policy implementation plus its parsed config.
pub struct ChildPolicyConfig {
    /// Registry name of the child policy.
    pub policy_name: String,
    /// The child's own parsed configuration.
    pub config: Option<Arc<dyn Any + Send + Sync>>,
}

/// Factory closure for one policy kind.
pub type PolicyFactory = Arc<dyn Fn(LbPolicyArgs) -> Arc<dyn LbPolicy> + Send + Sync>;

/// Name-to-factory map for policy instantiation.
#[derive(Default)]
pub struct PolicyRegistry {
    factories: Mutex<FxHashMap<&'static str, PolicyFactory>>,
}

impl PolicyRegistry {
    /// Empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register `factory` under `name`, replacing any previous binding.
    pub fn register(&self, name: &'static str, factory: PolicyFactory) {
        self.factories.lock().unwrap().insert(name, factory);
    }

    /// Instantiate the policy registered under `name`.
    pub fn create(&self, name: &str, args: LbPolicyArgs) -> Option<Arc<dyn LbPolicy>> {
        let factory = self.factories.lock().unwrap().get(name).cloned()?;
        Some(factory(args))
    }
}

//! Stateful-session host pinning.
//!
//! A prior RPC can tag its session with a cookie naming preferred
//! backend addresses; later picks for that session stick to one of those
//! backends while it stays healthy enough (per the configured override
//! status set). Subchannels for draining hosts are kept alive by the
//! policy itself for an idle window after the child policy releases
//! them, so existing sessions can finish where they started.

use std::{
    any::Any,
    sync::{Arc, Mutex, Weak},
    time::{Duration, Instant},
};

use rustc_hash::FxHashMap;

use super::{
    address::{EndpointAddress, HealthStatus},
    child_handler::ChildPolicyHandler,
    ChannelArgs, ChildPolicyConfig, ConnectivityState, LbHelper, LbPolicy, LbPolicyArgs,
    LbUpdate, PickArgs, PickResult, Picker, Subchannel, SubchannelStateWatcher, TraceSeverity,
};
use crate::{exec::TimerHandle, Status};

/// Registry name of the override-host policy.
pub const OVERRIDE_HOST_POLICY_NAME: &str = "xds_override_host_experimental";

const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Parsed override-host configuration.
pub struct OverrideHostConfig {
    /// Health statuses eligible for cookie overrides.
    pub override_host_statuses: Vec<HealthStatus>,
    /// How long an unused policy-owned subchannel is retained.
    pub connection_idle_timeout: Duration,
    /// The wrapped child policy.
    pub child_policy: Arc<ChildPolicyConfig>,
}

/// Per-call attribute carrying the session's preferred addresses and
/// receiving the authoritative list of the host actually chosen (which
/// is rewritten into the session cookie).
#[derive(Default)]
pub struct StatefulSessionAttribute {
    state: Mutex<SessionState>,
}

#[derive(Default)]
struct SessionState {
    cookie_addresses: Vec<String>,
    actual_addresses: Option<Vec<String>>,
}

impl StatefulSessionAttribute {
    /// Parse the comma-separated cookie value.
    pub fn new(cookie: &str) -> Arc<Self> {
        let cookie_addresses = cookie
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        Arc::new(Self {
            state: Mutex::new(SessionState {
                cookie_addresses,
                actual_addresses: None,
            }),
        })
    }

    /// The candidate addresses from the cookie, in preference order.
    pub fn cookie_addresses(&self) -> Vec<String> {
        self.state.lock().unwrap().cookie_addresses.clone()
    }

    /// The writeback performed by a successful override pick.
    pub fn actual_addresses(&self) -> Option<Vec<String>> {
        self.state.lock().unwrap().actual_addresses.clone()
    }

    fn set_actual_addresses(&self, addresses: Vec<String>) {
        self.state.lock().unwrap().actual_addresses = Some(addresses);
    }
}

/// The override-host policy. See the module docs.
pub struct OverrideHostPolicy {
    inner: Arc<OhInner>,
}

struct OhInner {
    args: LbPolicyArgs,
    state: Mutex<OhState>,
}

struct OhState {
    config: Option<Arc<OverrideHostConfig>>,
    child: Option<Arc<dyn LbPolicy>>,
    channel_args: ChannelArgs,
    entries: FxHashMap<String, SubchannelEntry>,
    sweep_timer: Option<TimerHandle>,
    shutdown: bool,
}

// Either the child policy owns the wrapper (we hold a weak ref), or the
// policy retained it past the child's release and owns it directly.
enum WrapperRef {
    None,
    Unowned(Weak<SubchannelWrapper>),
    Owned(Arc<SubchannelWrapper>),
}

impl WrapperRef {
    fn get(&self) -> Option<Arc<SubchannelWrapper>> {
        match self {
            WrapperRef::None => None,
            WrapperRef::Unowned(weak) => weak.upgrade(),
            WrapperRef::Owned(strong) => Some(strong.clone()),
        }
    }
}

struct SubchannelEntry {
    address: EndpointAddress,
    health: HealthStatus,
    connectivity: ConnectivityState,
    last_used: Instant,
    wrapper: WrapperRef,
    // The authoritative address list written back into the cookie.
    address_list: Vec<String>,
}

impl OverrideHostPolicy {
    /// Build the policy.
    pub fn new(args: LbPolicyArgs) -> Self {
        Self {
            inner: Arc::new(OhInner {
                args,
                state: Mutex::new(OhState {
                    config: None,
                    child: None,
                    channel_args: ChannelArgs::new(),
                    entries: FxHashMap::default(),
                    sweep_timer: None,
                    shutdown: false,
                }),
            }),
        }
    }

    #[cfg(test)]
    fn sweep_for_test(&self) {
        OhInner::sweep(&self.inner);
    }
}

impl LbPolicy for OverrideHostPolicy {
    fn name(&self) -> &'static str {
        OVERRIDE_HOST_POLICY_NAME
    }

    fn update(&self, update: LbUpdate) -> Result<(), Status> {
        let config = update
            .config
            .clone()
            .and_then(|c| c.downcast::<OverrideHostConfig>().ok())
            .ok_or_else(|| Status::invalid_argument("missing override host config"))?;
        let addresses = update.addresses.clone().unwrap_or_default();

        // Rebuild the entry map. Draining addresses stay pickable via
        // cookies but are withheld from the child policy, so the policy
        // takes ownership of their wrappers.
        let mut released: Vec<Arc<SubchannelWrapper>> = Vec::new();
        let child = {
            let mut state = self.inner.state.lock().unwrap();
            if state.shutdown {
                return Ok(());
            }
            state.config = Some(config.clone());
            state.channel_args = update.args.clone();

            let now = Instant::now();
            let mut keep: FxHashMap<String, SubchannelEntry> = FxHashMap::default();
            for address in &addresses {
                let key = address.address.to_string();
                let mut entry = match state.entries.remove(&key) {
                    Some(existing) => existing,
                    None => SubchannelEntry {
                        address: address.clone(),
                        health: address.health,
                        connectivity: ConnectivityState::Idle,
                        last_used: now,
                        wrapper: WrapperRef::None,
                        address_list: vec![key.clone()],
                    },
                };
                entry.address = address.clone();
                entry.health = address.health;
                entry.address_list = vec![key.clone()];
                if address.health == HealthStatus::Draining {
                    // The child is about to release this subchannel;
                    // retain it while the session window is open.
                    if now.duration_since(entry.last_used) < config.connection_idle_timeout {
                        let upgraded = match &entry.wrapper {
                            WrapperRef::Unowned(weak) => weak.upgrade(),
                            _ => None,
                        };
                        if let Some(strong) = upgraded {
                            entry.wrapper = WrapperRef::Owned(strong);
                        }
                    }
                } else if matches!(entry.wrapper, WrapperRef::Owned(_)) {
                    // Back under child ownership.
                    let prev = std::mem::replace(&mut entry.wrapper, WrapperRef::None);
                    if let WrapperRef::Owned(strong) = prev {
                        entry.wrapper = WrapperRef::Unowned(Arc::downgrade(&strong));
                        released.push(strong);
                    }
                }
                keep.insert(key, entry);
            }
            for (_, entry) in state.entries.drain() {
                if let WrapperRef::Owned(strong) = entry.wrapper {
                    released.push(strong);
                }
            }
            state.entries = keep;
            state.child.clone()
        };
        // Owned refs from removed entries are dropped here, outside the
        // policy mutex.
        drop(released);

        let child = match child {
            Some(child) => child,
            None => {
                let helper = Arc::new(OverrideHostHelper {
                    inner: Arc::downgrade(&self.inner),
                });
                let child: Arc<dyn LbPolicy> = Arc::new(ChildPolicyHandler::new(LbPolicyArgs {
                    helper,
                    serializer: self.inner.args.serializer.clone(),
                    registry: self.inner.args.registry.clone(),
                }));
                self.inner.state.lock().unwrap().child = Some(child.clone());
                child
            }
        };

        OhInner::ensure_sweep_timer(&self.inner, &config);

        let mut forwarded = update;
        forwarded.addresses = Ok(addresses
            .into_iter()
            .filter(|a| a.health != HealthStatus::Draining)
            .collect());
        forwarded.config = Some(Arc::new(ChildPolicyConfig {
            policy_name: config.child_policy.policy_name.clone(),
            config: config.child_policy.config.clone(),
        }) as Arc<dyn Any + Send + Sync>);
        child.update(forwarded)
    }

    fn exit_idle(&self) {
        if let Some(child) = self.inner.child() {
            child.exit_idle();
        }
    }

    fn reset_backoff(&self) {
        if let Some(child) = self.inner.child() {
            child.reset_backoff();
        }
    }

    fn shutdown(&self) {
        let (child, timer, entries) = {
            let mut state = self.inner.state.lock().unwrap();
            state.shutdown = true;
            (
                state.child.take(),
                state.sweep_timer.take(),
                std::mem::take(&mut state.entries),
            )
        };
        if let Some(timer) = timer {
            self.inner.args.helper.event_engine().cancel(timer);
        }
        drop(entries);
        if let Some(child) = child {
            child.shutdown();
        }
    }
}

impl OhInner {
    fn child(&self) -> Option<Arc<dyn LbPolicy>> {
        self.state.lock().unwrap().child.clone()
    }

    fn ensure_sweep_timer(this: &Arc<Self>, config: &Arc<OverrideHostConfig>) {
        let interval = config.connection_idle_timeout.max(MIN_SWEEP_INTERVAL);
        let engine = this.args.helper.event_engine();
        let mut state = this.state.lock().unwrap();
        if state.sweep_timer.is_some() || state.shutdown {
            return;
        }
        let weak = Arc::downgrade(this);
        state.sweep_timer = Some(engine.run_after(interval, move || {
            if let Some(inner) = weak.upgrade() {
                inner.state.lock().unwrap().sweep_timer = None;
                OhInner::sweep(&inner);
                let config = inner.state.lock().unwrap().config.clone();
                if let Some(config) = config {
                    OhInner::ensure_sweep_timer(&inner, &config);
                }
            }
        }));
    }

    // Drop policy-owned wrappers whose sessions have gone quiet.
    fn sweep(this: &Arc<Self>) {
        let mut released: Vec<Arc<SubchannelWrapper>> = Vec::new();
        {
            let mut state = this.state.lock().unwrap();
            let Some(config) = state.config.clone() else {
                return;
            };
            let now = Instant::now();
            for entry in state.entries.values_mut() {
                let expired = matches!(entry.wrapper, WrapperRef::Owned(_))
                    && now.duration_since(entry.last_used) >= config.connection_idle_timeout;
                if expired {
                    tracing::debug!(address = %entry.address.address, "dropping idle retained subchannel");
                    if let WrapperRef::Owned(strong) =
                        std::mem::replace(&mut entry.wrapper, WrapperRef::None)
                    {
                        released.push(strong);
                    }
                }
            }
        }
        drop(released);
    }

    // Async creation for a cookie candidate that has no subchannel yet.
    fn create_owned_subchannel(this: &Arc<Self>, key: String) {
        let (address, args) = {
            let state = this.state.lock().unwrap();
            if state.shutdown {
                return;
            }
            match state.entries.get(&key) {
                Some(entry) if entry.wrapper.get().is_none() => {
                    (entry.address.clone(), state.channel_args.clone())
                }
                _ => return,
            }
        };
        let helper = Arc::new(OverrideHostHelper {
            inner: Arc::downgrade(this),
        });
        let wrapper = helper.wrap_subchannel(&address, &args);
        {
            let mut state = this.state.lock().unwrap();
            if let Some(entry) = state.entries.get_mut(&key) {
                entry.wrapper = WrapperRef::Owned(wrapper.clone());
            }
        }
        wrapper.connect();
    }

    fn on_wrapper_state_change(&self, key: &str, connectivity: ConnectivityState) {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.entries.get_mut(key) {
            entry.connectivity = connectivity;
        }
    }
}

/// Wraps created subchannels so the policy can observe their state and
/// retain them past the child's release.
struct SubchannelWrapper {
    inner: Arc<dyn Subchannel>,
    key: String,
}

impl Subchannel for SubchannelWrapper {
    fn connect(&self) {
        self.inner.connect();
    }

    fn address(&self) -> EndpointAddress {
        self.inner.address()
    }

    fn add_watcher(&self, watcher: Arc<dyn SubchannelStateWatcher>) {
        self.inner.add_watcher(watcher);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct EntryWatcher {
    policy: Weak<OhInner>,
    key: String,
}

impl SubchannelStateWatcher for EntryWatcher {
    fn on_state_change(&self, state: ConnectivityState, _status: Status) {
        if let Some(policy) = self.policy.upgrade() {
            policy.on_wrapper_state_change(&self.key, state);
        }
    }
}

struct OverrideHostHelper {
    inner: Weak<OhInner>,
}

impl OverrideHostHelper {
    fn wrap_subchannel(
        &self,
        address: &EndpointAddress,
        args: &ChannelArgs,
    ) -> Arc<SubchannelWrapper> {
        let inner = self.inner.upgrade().expect("override host policy destroyed");
        let raw = inner.args.helper.create_subchannel(address, args);
        let key = address.address.to_string();
        raw.add_watcher(Arc::new(EntryWatcher {
            policy: self.inner.clone(),
            key: key.clone(),
        }));
        Arc::new(SubchannelWrapper { inner: raw, key })
    }
}

impl LbHelper for OverrideHostHelper {
    fn create_subchannel(
        &self,
        address: &EndpointAddress,
        args: &ChannelArgs,
    ) -> Arc<dyn Subchannel> {
        let inner = self.inner.upgrade().expect("override host policy destroyed");
        let wrapper = self.wrap_subchannel(address, args);
        {
            let mut state = inner.state.lock().unwrap();
            if let Some(entry) = state.entries.get_mut(&wrapper.key) {
                entry.wrapper = WrapperRef::Unowned(Arc::downgrade(&wrapper));
            }
        }
        wrapper
    }

    fn update_state(&self, state: ConnectivityState, status: Status, picker: Arc<dyn Picker>) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let statuses = {
            let guard = inner.state.lock().unwrap();
            if guard.shutdown {
                return;
            }
            guard
                .config
                .as_ref()
                .map(|c| c.override_host_statuses.clone())
                .unwrap_or_default()
        };
        let wrapped = Arc::new(OverrideHostPicker {
            policy: inner.clone(),
            child: picker,
            override_statuses: statuses,
        });
        inner.args.helper.update_state(state, status, wrapped);
    }

    fn request_reresolution(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.args.helper.request_reresolution();
        }
    }

    fn add_trace_event(&self, severity: TraceSeverity, message: &str) {
        if let Some(inner) = self.inner.upgrade() {
            inner.args.helper.add_trace_event(severity, message);
        }
    }

    fn event_engine(&self) -> Arc<crate::exec::TimerDriver> {
        self.inner
            .upgrade()
            .expect("override host policy destroyed")
            .args
            .helper
            .event_engine()
    }
}

struct OverrideHostPicker {
    policy: Arc<OhInner>,
    child: Arc<dyn Picker>,
    override_statuses: Vec<HealthStatus>,
}

impl Picker for OverrideHostPicker {
    fn pick(&self, args: &PickArgs<'_>) -> PickResult {
        let Some(session) = args.attributes.get::<StatefulSessionAttribute>() else {
            return self.child.pick(args);
        };
        let candidates = session.cookie_addresses();
        if candidates.is_empty() {
            return self.child.pick(args);
        }

        // Track each fallback tier across the whole scan; the tiers are
        // ranked against each other only once every candidate has been
        // seen, not in cookie order.
        let mut idle_subchannel: Option<Arc<SubchannelWrapper>> = None;
        let mut found_connecting = false;
        let mut address_with_no_subchannel: Option<String> = None;
        {
            let mut state = self.policy.state.lock().unwrap();
            for key in &candidates {
                let Some(entry) = state.entries.get_mut(key) else {
                    continue;
                };
                if !self.override_statuses.contains(&entry.health) {
                    continue;
                }
                let wrapper = entry.wrapper.get();
                match (&wrapper, entry.connectivity) {
                    (Some(wrapper), ConnectivityState::Ready) => {
                        entry.last_used = Instant::now();
                        session.set_actual_addresses(entry.address_list.clone());
                        return PickResult::Complete {
                            subchannel: wrapper.clone(),
                            tracker: None,
                        };
                    }
                    (Some(wrapper), ConnectivityState::Idle) => {
                        if idle_subchannel.is_none() {
                            idle_subchannel = Some(wrapper.clone());
                        }
                    }
                    (Some(_), ConnectivityState::Connecting) => {
                        found_connecting = true;
                    }
                    (None, _) => {
                        if address_with_no_subchannel.is_none() {
                            address_with_no_subchannel = Some(key.clone());
                        }
                    }
                    _ => {}
                }
            }
        }

        // No READY candidate. An idle one can be kicked right now, so
        // it beats waiting on a connection already in flight, which in
        // turn beats having to create a subchannel from scratch.
        if let Some(wrapper) = idle_subchannel {
            wrapper.connect();
            return PickResult::Queue;
        }
        if found_connecting {
            return PickResult::Queue;
        }
        if let Some(key) = address_with_no_subchannel {
            let policy = self.policy.clone();
            let serializer = self.policy.args.serializer.clone();
            serializer.run(move || OhInner::create_owned_subchannel(&policy, key));
            return PickResult::Queue;
        }
        self.child.pick(args)
    }
}

//! Priority load balancing: ordered children with failover and
//! deactivation timers.
//!
//! The policy walks its priority list in order and routes to the first
//! usable child. A child that has not proven itself yet is given a
//! failover window before the walk moves past it; children that lose
//! selection (or drop out of the config) are retained for a grace period
//! so flapping configs do not rebuild warm connections.

use std::{
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use rustc_hash::FxHashMap;

use super::{
    address::{EndpointAddress, HierarchicalAddressMap},
    child_handler::ChildPolicyHandler,
    ChannelArgs, ChildPolicyConfig, ConnectivityState, FailingPicker, LbHelper, LbPolicy,
    LbPolicyArgs, LbUpdate, Picker, QueuePicker,
};
use crate::{exec::TimerHandle, Status};

/// Registry name of the priority policy.
pub const PRIORITY_POLICY_NAME: &str = "priority_experimental";

const DEFAULT_FAILOVER_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_CHILD_RETENTION_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Per-child priority configuration.
pub struct PriorityChildConfig {
    /// The child policy to run for this priority.
    pub config: Arc<ChildPolicyConfig>,
    /// Suppress re-resolution requests from this child.
    pub ignore_reresolution_requests: bool,
}

/// Parsed priority policy configuration.
pub struct PriorityLbConfig {
    /// Child names in priority order. Every name must appear in
    /// `children`.
    pub priorities: Vec<String>,
    /// Child configurations by name.
    pub children: FxHashMap<String, PriorityChildConfig>,
    /// How long a child may stay unproven before the walk moves past it.
    pub failover_timeout: Duration,
    /// How long an unselected child is retained.
    pub child_retention_interval: Duration,
}

impl PriorityLbConfig {
    /// Config with default timer durations.
    pub fn new(
        priorities: Vec<String>,
        children: FxHashMap<String, PriorityChildConfig>,
    ) -> Self {
        Self {
            priorities,
            children,
            failover_timeout: DEFAULT_FAILOVER_TIMEOUT,
            child_retention_interval: DEFAULT_CHILD_RETENTION_INTERVAL,
        }
    }
}

/// The priority policy. See the module docs.
pub struct PriorityPolicy {
    inner: Arc<PriorityInner>,
}

struct PriorityInner {
    args: LbPolicyArgs,
    state: Mutex<PriorityState>,
}

struct PriorityState {
    config: Option<Arc<PriorityLbConfig>>,
    addresses: Vec<EndpointAddress>,
    resolution_note: String,
    channel_args: ChannelArgs,
    children: FxHashMap<String, ChildEntry>,
    update_in_progress: bool,
    shutdown: bool,
}

struct ChildEntry {
    policy: Arc<dyn LbPolicy>,
    helper: Arc<PriorityChildHelper>,
    connectivity: ConnectivityState,
    status: Status,
    picker: Arc<dyn Picker>,
    failover_timer: Option<TimerHandle>,
    deactivation_timer: Option<TimerHandle>,
    // Bumped whenever a timer is cancelled so a fired-but-queued
    // callback can detect it is stale.
    timer_generation: u64,
    seen_ready_or_idle: bool,
    deactivated: bool,
}

impl PriorityPolicy {
    /// Build the policy.
    pub fn new(args: LbPolicyArgs) -> Self {
        Self {
            inner: Arc::new(PriorityInner {
                args,
                state: Mutex::new(PriorityState {
                    config: None,
                    addresses: Vec::new(),
                    resolution_note: String::new(),
                    channel_args: ChannelArgs::new(),
                    children: FxHashMap::default(),
                    update_in_progress: false,
                    shutdown: false,
                }),
            }),
        }
    }

    /// Register the policy under [`PRIORITY_POLICY_NAME`].
    pub fn register(registry: &super::PolicyRegistry) {
        registry.register(
            PRIORITY_POLICY_NAME,
            Arc::new(|args| Arc::new(PriorityPolicy::new(args)) as Arc<dyn LbPolicy>),
        );
    }
}

impl LbPolicy for PriorityPolicy {
    fn name(&self) -> &'static str {
        PRIORITY_POLICY_NAME
    }

    fn update(&self, update: LbUpdate) -> Result<(), Status> {
        let config = update
            .config
            .clone()
            .and_then(|c| c.downcast::<PriorityLbConfig>().ok())
            .ok_or_else(|| Status::invalid_argument("missing priority policy config"))?;
        for name in &config.priorities {
            if !config.children.contains_key(name) {
                let status = Status::invalid_argument(format!(
                    "priority {name:?} is not present in the children map"
                ));
                self.inner.args.helper.update_state(
                    ConnectivityState::TransientFailure,
                    status.clone(),
                    Arc::new(FailingPicker(status.clone())),
                );
                return Err(status);
            }
        }

        let addresses = match update.addresses {
            Ok(addresses) => addresses,
            Err(ref status) => {
                tracing::debug!(%status, "priority policy received resolver error");
                Vec::new()
            }
        };

        let (existing, removed) = {
            let mut state = self.inner.state.lock().unwrap();
            if state.shutdown {
                return Ok(());
            }
            state.update_in_progress = true;
            state.config = Some(config.clone());
            state.addresses = addresses;
            state.resolution_note = update.resolution_note.clone();
            state.channel_args = update.args.clone();
            let existing: Vec<String> = state
                .children
                .keys()
                .filter(|name| config.children.contains_key(*name))
                .cloned()
                .collect();
            let removed: Vec<String> = state
                .children
                .keys()
                .filter(|name| !config.children.contains_key(*name))
                .cloned()
                .collect();
            (existing, removed)
        };

        // Forward the new sub-config to every surviving child; their
        // reentrant state reports are absorbed by update_in_progress.
        for name in existing {
            PriorityInner::forward_update(&self.inner, &name);
        }
        for name in removed {
            PriorityInner::maybe_deactivate(&self.inner, &name);
        }

        self.inner.state.lock().unwrap().update_in_progress = false;
        PriorityInner::choose_priority(&self.inner);
        Ok(())
    }

    fn exit_idle(&self) {
        for policy in self.inner.child_policies() {
            policy.exit_idle();
        }
    }

    fn reset_backoff(&self) {
        for policy in self.inner.child_policies() {
            policy.reset_backoff();
        }
    }

    fn shutdown(&self) {
        let children = {
            let mut state = self.inner.state.lock().unwrap();
            state.shutdown = true;
            std::mem::take(&mut state.children)
        };
        let engine = self.inner.args.helper.event_engine();
        for (_, entry) in children {
            if let Some(handle) = entry.failover_timer {
                engine.cancel(handle);
            }
            if let Some(handle) = entry.deactivation_timer {
                engine.cancel(handle);
            }
            entry.policy.shutdown();
        }
    }
}

impl PriorityInner {
    fn child_policies(&self) -> Vec<Arc<dyn LbPolicy>> {
        self.state
            .lock()
            .unwrap()
            .children
            .values()
            .map(|c| c.policy.clone())
            .collect()
    }

    // The idempotent selection walk. Runs on the work serializer.
    fn choose_priority(this: &Arc<Self>) {
        let config = {
            let state = this.state.lock().unwrap();
            if state.shutdown || state.update_in_progress {
                return;
            }
            state.config.clone()
        };
        let Some(config) = config else { return };
        if config.priorities.is_empty() {
            let status = Status::unavailable("priority policy has an empty priority list");
            this.args.helper.update_state(
                ConnectivityState::TransientFailure,
                status.clone(),
                Arc::new(FailingPicker(status)),
            );
            return;
        }

        for (idx, name) in config.priorities.iter().enumerate() {
            Self::ensure_child(this, &config, name);
            Self::maybe_reactivate(this, name);
            let (connectivity, failover_pending) = {
                let state = this.state.lock().unwrap();
                let entry = &state.children[name];
                (entry.connectivity, entry.failover_timer.is_some())
            };
            match connectivity {
                ConnectivityState::Ready | ConnectivityState::Idle => {
                    tracing::debug!(child = %name, priority = idx, "selected priority");
                    Self::deactivate_lower_priorities(this, &config, idx);
                    Self::surface_child(this, name);
                    return;
                }
                _ if failover_pending => {
                    // Still inside its failover window: give it the
                    // chance, and leave the channel state untouched.
                    tracing::debug!(child = %name, priority = idx, "waiting on failover timer");
                    return;
                }
                _ => {}
            }
        }

        // Nothing usable and no failover pending: prefer a child that is
        // at least trying to connect.
        for name in &config.priorities {
            let connecting = {
                let state = this.state.lock().unwrap();
                state
                    .children
                    .get(name)
                    .map(|e| e.connectivity == ConnectivityState::Connecting)
                    .unwrap_or(false)
            };
            if connecting {
                Self::surface_child(this, name);
                return;
            }
        }

        // Everything failed; delegate to the last child so its error
        // status reaches the channel.
        if let Some(name) = config.priorities.last() {
            Self::surface_child(this, name);
        }
    }

    fn surface_child(this: &Arc<Self>, name: &str) {
        let snapshot = {
            let state = this.state.lock().unwrap();
            state
                .children
                .get(name)
                .map(|e| (e.connectivity, e.status.clone(), e.picker.clone()))
        };
        if let Some((connectivity, status, picker)) = snapshot {
            this.args.helper.update_state(connectivity, status, picker);
        }
    }

    fn ensure_child(this: &Arc<Self>, config: &Arc<PriorityLbConfig>, name: &str) {
        let exists = this.state.lock().unwrap().children.contains_key(name);
        if exists {
            return;
        }
        let helper = Arc::new(PriorityChildHelper {
            inner: Arc::downgrade(this),
            name: name.to_string(),
        });
        let policy: Arc<dyn LbPolicy> = Arc::new(ChildPolicyHandler::new(LbPolicyArgs {
            helper: helper.clone() as Arc<dyn LbHelper>,
            serializer: this.args.serializer.clone(),
            registry: this.args.registry.clone(),
        }));
        {
            let mut state = this.state.lock().unwrap();
            if state.shutdown {
                return;
            }
            state.children.insert(
                name.to_string(),
                ChildEntry {
                    policy,
                    helper,
                    connectivity: ConnectivityState::Connecting,
                    status: Status::ok(),
                    picker: Arc::new(QueuePicker),
                    failover_timer: None,
                    deactivation_timer: None,
                    timer_generation: 0,
                    seen_ready_or_idle: false,
                    deactivated: false,
                },
            );
        }
        Self::start_failover_timer(this, config, name);
        Self::forward_update(this, name);
    }

    fn forward_update(this: &Arc<Self>, name: &str) {
        let forwarded = {
            let state = this.state.lock().unwrap();
            let Some(config) = state.config.as_ref() else {
                return;
            };
            let Some(child_config) = config.children.get(name) else {
                return;
            };
            let Some(entry) = state.children.get(name) else {
                return;
            };
            let map = HierarchicalAddressMap::new(&state.addresses);
            let addresses: Vec<EndpointAddress> = map.addresses_of(name).collect();
            let update = LbUpdate {
                addresses: Ok(addresses),
                config: Some(Arc::new(ChildPolicyConfig {
                    policy_name: child_config.config.policy_name.clone(),
                    config: child_config.config.config.clone(),
                })),
                resolution_note: state.resolution_note.clone(),
                args: state.channel_args.clone(),
            };
            Some((entry.policy.clone(), update))
        };
        if let Some((policy, update)) = forwarded {
            if let Err(status) = policy.update(update) {
                tracing::warn!(child = %name, %status, "child update failed");
            }
        }
    }

    fn start_failover_timer(this: &Arc<Self>, config: &Arc<PriorityLbConfig>, name: &str) {
        let engine = this.args.helper.event_engine();
        let mut state = this.state.lock().unwrap();
        let Some(entry) = state.children.get_mut(name) else {
            return;
        };
        if entry.failover_timer.is_some() {
            return;
        }
        entry.timer_generation += 1;
        let generation = entry.timer_generation;
        let weak = Arc::downgrade(this);
        let child = name.to_string();
        let serializer = this.args.serializer.clone();
        let handle = engine.run_after(config.failover_timeout, move || {
            let Some(inner) = weak.upgrade() else { return };
            serializer.run(move || Self::on_failover_timer(&inner, &child, generation));
        });
        entry.failover_timer = Some(handle);
    }

    fn on_failover_timer(this: &Arc<Self>, name: &str, generation: u64) {
        {
            let mut state = this.state.lock().unwrap();
            let Some(entry) = state.children.get_mut(name) else {
                return;
            };
            if entry.timer_generation != generation || entry.failover_timer.is_none() {
                return;
            }
            entry.failover_timer = None;
            tracing::debug!(child = %name, "failover timer fired");
        }
        Self::choose_priority(this);
    }

    fn deactivate_lower_priorities(this: &Arc<Self>, config: &Arc<PriorityLbConfig>, idx: usize) {
        for name in config.priorities.iter().skip(idx + 1) {
            Self::maybe_deactivate(this, name);
        }
    }

    fn maybe_deactivate(this: &Arc<Self>, name: &str) {
        let retention = {
            let state = this.state.lock().unwrap();
            match (&state.config, state.children.get(name)) {
                (Some(config), Some(entry)) if !entry.deactivated => {
                    config.child_retention_interval
                }
                _ => return,
            }
        };
        let engine = this.args.helper.event_engine();
        let mut state = this.state.lock().unwrap();
        let Some(entry) = state.children.get_mut(name) else {
            return;
        };
        if entry.deactivated {
            return;
        }
        entry.deactivated = true;
        entry.timer_generation += 1;
        let generation = entry.timer_generation;
        let weak = Arc::downgrade(this);
        let child = name.to_string();
        let serializer = this.args.serializer.clone();
        tracing::debug!(child = %name, "deactivating priority child");
        entry.deactivation_timer = Some(engine.run_after(retention, move || {
            let Some(inner) = weak.upgrade() else { return };
            serializer.run(move || Self::on_deactivation_timer(&inner, &child, generation));
        }));
    }

    fn maybe_reactivate(this: &Arc<Self>, name: &str) {
        let handle = {
            let mut state = this.state.lock().unwrap();
            let Some(entry) = state.children.get_mut(name) else {
                return;
            };
            if !entry.deactivated {
                return;
            }
            entry.deactivated = false;
            entry.timer_generation += 1;
            entry.deactivation_timer.take()
        };
        tracing::debug!(child = %name, "reactivating priority child");
        if let Some(handle) = handle {
            this.args.helper.event_engine().cancel(handle);
        }
    }

    fn on_deactivation_timer(this: &Arc<Self>, name: &str, generation: u64) {
        let entry = {
            let mut state = this.state.lock().unwrap();
            match state.children.get(name) {
                Some(entry)
                    if entry.timer_generation == generation && entry.deactivated =>
                {
                    state.children.remove(name)
                }
                _ => return,
            }
        };
        if let Some(entry) = entry {
            tracing::debug!(child = %name, "deleting deactivated priority child");
            entry.policy.shutdown();
        }
    }

    fn on_child_state_update(
        this: &Arc<Self>,
        helper: &PriorityChildHelper,
        connectivity: ConnectivityState,
        status: Status,
        picker: Arc<dyn Picker>,
    ) {
        let mut start_failover = false;
        let mut cancelled = None;
        let run_choose = {
            let mut state = this.state.lock().unwrap();
            if state.shutdown {
                return;
            }
            let Some(entry) = state.children.get_mut(&helper.name) else {
                return;
            };
            if !std::ptr::eq(Arc::as_ptr(&entry.helper), helper) {
                // A replaced child's late report.
                return;
            }
            let old = entry.connectivity;
            entry.connectivity = connectivity;
            entry.status = status;
            entry.picker = picker;
            match connectivity {
                ConnectivityState::Ready | ConnectivityState::Idle => {
                    entry.seen_ready_or_idle = true;
                    cancelled = entry.failover_timer.take();
                    entry.timer_generation += 1;
                }
                ConnectivityState::TransientFailure => {
                    entry.seen_ready_or_idle = false;
                    cancelled = entry.failover_timer.take();
                    entry.timer_generation += 1;
                }
                ConnectivityState::Connecting => {
                    if old != ConnectivityState::Connecting
                        && !entry.seen_ready_or_idle
                        && entry.failover_timer.is_none()
                    {
                        start_failover = true;
                    }
                }
            }
            !state.update_in_progress
        };
        if let Some(handle) = cancelled {
            this.args.helper.event_engine().cancel(handle);
        }
        if start_failover {
            let config = this.state.lock().unwrap().config.clone();
            if let Some(config) = config {
                Self::start_failover_timer(this, &config, &helper.name);
            }
        }
        if run_choose {
            Self::choose_priority(this);
        }
    }
}

struct PriorityChildHelper {
    inner: Weak<PriorityInner>,
    name: String,
}

impl LbHelper for PriorityChildHelper {
    fn create_subchannel(
        &self,
        address: &EndpointAddress,
        args: &ChannelArgs,
    ) -> Arc<dyn super::Subchannel> {
        let inner = self.inner.upgrade().expect("priority policy destroyed");
        inner.args.helper.create_subchannel(address, args)
    }

    fn update_state(&self, state: ConnectivityState, status: Status, picker: Arc<dyn Picker>) {
        if let Some(inner) = self.inner.upgrade() {
            PriorityInner::on_child_state_update(&inner, self, state, status, picker);
        }
    }

    fn request_reresolution(&self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let ignore = {
            let state = inner.state.lock().unwrap();
            state
                .config
                .as_ref()
                .and_then(|c| c.children.get(&self.name))
                .map(|c| c.ignore_reresolution_requests)
                .unwrap_or(true)
        };
        if !ignore {
            inner.args.helper.request_reresolution();
        }
    }

    fn add_trace_event(&self, severity: super::TraceSeverity, message: &str) {
        if let Some(inner) = self.inner.upgrade() {
            inner.args.helper.add_trace_event(severity, message);
        }
    }

    fn event_engine(&self) -> Arc<crate::exec::TimerDriver> {
        self.inner
            .upgrade()
            .expect("priority policy destroyed")
            .args
            .helper
            .event_engine()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        exec::WorkSerializer,
        lb::{
            address::HierarchicalPath,
            test_util::{register_leaf, LeafConfig, LeafControl, RecordingHelper, TagPicker,
                LEAF_POLICY_NAME},
            PolicyRegistry,
        },
        Code,
    };

    fn leaf_child(control: &Arc<LeafControl>) -> PriorityChildConfig {
        PriorityChildConfig {
            config: Arc::new(ChildPolicyConfig {
                policy_name: LEAF_POLICY_NAME.to_string(),
                config: Some(Arc::new(LeafConfig {
                    control: control.clone(),
                })),
            }),
            ignore_reresolution_requests: false,
        }
    }

    fn config_for(
        children: &[(&str, &Arc<LeafControl>)],
        failover: Duration,
        retention: Duration,
    ) -> Arc<PriorityLbConfig> {
        let mut map = FxHashMap::default();
        for (name, control) in children {
            map.insert(name.to_string(), leaf_child(control));
        }
        let mut config = PriorityLbConfig::new(
            children.iter().map(|(name, _)| name.to_string()).collect(),
            map,
        );
        config.failover_timeout = failover;
        config.child_retention_interval = retention;
        Arc::new(config)
    }

    fn update_with(config: Arc<PriorityLbConfig>, names: &[&str]) -> LbUpdate {
        let addresses = names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                EndpointAddress::new(format!("10.0.0.{}:443", i + 1).parse().unwrap())
                    .with_path(HierarchicalPath::from(&[*name][..]))
            })
            .collect();
        let mut update = LbUpdate::with_addresses(addresses);
        update.config = Some(config);
        update
    }

    fn setup() -> (Arc<RecordingHelper>, PriorityPolicy) {
        let helper = RecordingHelper::new();
        let registry = PolicyRegistry::new();
        register_leaf(&registry);
        let policy = PriorityPolicy::new(LbPolicyArgs {
            helper: helper.clone(),
            serializer: WorkSerializer::new(),
            registry,
        });
        (helper, policy)
    }

    fn ok(label: &'static str) -> Status {
        Status::new(Code::Ok, label)
    }

    #[test]
    fn ready_child_selected_and_failover_keeps_picker() {
        let (helper, policy) = setup();
        let a = LeafControl::new();
        let b = LeafControl::new();
        let config = config_for(
            &[("A", &a), ("B", &b)],
            Duration::from_secs(10),
            Duration::from_secs(900),
        );
        policy.update(update_with(config, &["A", "B"])).unwrap();

        // Only the highest priority is created eagerly.
        assert!(a.is_attached());
        assert!(!b.is_attached());
        // A got its own address subset with the path consumed.
        let a_addrs = a.addresses.lock().unwrap().clone();
        assert_eq!(a_addrs.len(), 1);
        assert!(a_addrs[0].path.is_empty());

        let pa: Arc<dyn Picker> = Arc::new(TagPicker("PA"));
        a.report(ConnectivityState::Ready, ok("A"), pa.clone());
        let (state, _, picker) = helper.last_state().unwrap();
        assert_eq!(state, ConnectivityState::Ready);
        assert!(Arc::ptr_eq(&picker, &pa));

        // A fails; B is created with a failover window, and until B
        // reports, the channel keeps A's last picker.
        a.report(
            ConnectivityState::TransientFailure,
            Status::unavailable("A down"),
            Arc::new(TagPicker("PA-fail")),
        );
        assert!(b.is_attached());
        let (state, _, picker) = helper.last_state().unwrap();
        assert_eq!(state, ConnectivityState::Ready);
        assert!(Arc::ptr_eq(&picker, &pa));

        let pb: Arc<dyn Picker> = Arc::new(TagPicker("PB"));
        b.report(ConnectivityState::Ready, ok("B"), pb.clone());
        let (state, _, picker) = helper.last_state().unwrap();
        assert_eq!(state, ConnectivityState::Ready);
        assert!(Arc::ptr_eq(&picker, &pb));
    }

    #[test]
    fn choose_priority_is_idempotent() {
        let (helper, policy) = setup();
        let a = LeafControl::new();
        let b = LeafControl::new();
        let config = config_for(
            &[("A", &a), ("B", &b)],
            Duration::from_secs(10),
            Duration::from_secs(900),
        );
        policy.update(update_with(config, &["A", "B"])).unwrap();
        let pa: Arc<dyn Picker> = Arc::new(TagPicker("PA"));
        a.report(ConnectivityState::Ready, ok("A"), pa.clone());

        let reports_before = helper.states.lock().unwrap().len();
        // Re-running the selection with an unchanged state vector keeps
        // selecting the same child.
        PriorityInner::choose_priority(&policy.inner);
        PriorityInner::choose_priority(&policy.inner);
        let states = helper.states.lock().unwrap();
        assert_eq!(states.len(), reports_before + 2);
        for (_, _, picker) in states.iter().skip(reports_before) {
            assert!(Arc::ptr_eq(picker, &pa));
        }
    }

    #[test]
    fn failover_timer_expiry_surfaces_connecting_child() {
        let (helper, policy) = setup();
        let a = LeafControl::new();
        let config = config_for(
            &[("A", &a)],
            Duration::from_millis(40),
            Duration::from_secs(900),
        );
        policy.update(update_with(config, &["A"])).unwrap();
        // Nothing reported yet and the failover window is open: the
        // channel state is untouched.
        assert!(helper.last_state().is_none());

        std::thread::sleep(Duration::from_millis(200));
        let (state, _, _) = helper.last_state().expect("failover expiry must report");
        assert_eq!(state, ConnectivityState::Connecting);
    }

    #[test]
    fn lower_priority_deactivated_and_deleted_after_retention() {
        let (helper, policy) = setup();
        let a = LeafControl::new();
        let b = LeafControl::new();
        let config = config_for(
            &[("A", &a), ("B", &b)],
            Duration::from_secs(10),
            Duration::from_millis(80),
        );
        policy.update(update_with(config, &["A", "B"])).unwrap();

        a.report(
            ConnectivityState::TransientFailure,
            Status::unavailable("A down"),
            Arc::new(TagPicker("PA-fail")),
        );
        let pb: Arc<dyn Picker> = Arc::new(TagPicker("PB"));
        b.report(ConnectivityState::Ready, ok("B"), pb.clone());
        assert!(Arc::ptr_eq(&helper.last_picker().unwrap(), &pb));

        // A recovers: B drops below the selection and is deactivated,
        // then deleted when the retention interval lapses.
        let pa: Arc<dyn Picker> = Arc::new(TagPicker("PA"));
        a.report(ConnectivityState::Ready, ok("A"), pa.clone());
        assert!(Arc::ptr_eq(&helper.last_picker().unwrap(), &pa));
        assert!(!b.was_shutdown.load(std::sync::atomic::Ordering::SeqCst));

        std::thread::sleep(Duration::from_millis(250));
        assert!(b.was_shutdown.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn reactivation_cancels_deletion() {
        let (helper, policy) = setup();
        let a = LeafControl::new();
        let b = LeafControl::new();
        let config = config_for(
            &[("A", &a), ("B", &b)],
            Duration::from_secs(10),
            Duration::from_millis(500),
        );
        policy.update(update_with(config, &["A", "B"])).unwrap();

        a.report(
            ConnectivityState::TransientFailure,
            Status::unavailable("A down"),
            Arc::new(TagPicker("PA-fail")),
        );
        let pb: Arc<dyn Picker> = Arc::new(TagPicker("PB"));
        b.report(ConnectivityState::Ready, ok("B"), pb.clone());

        // A comes back, deactivating B; A failing again inside the
        // retention window must reactivate B, not rebuild it.
        let pa: Arc<dyn Picker> = Arc::new(TagPicker("PA"));
        a.report(ConnectivityState::Ready, ok("A"), pa.clone());
        assert!(Arc::ptr_eq(&helper.last_picker().unwrap(), &pa));
        a.report(
            ConnectivityState::TransientFailure,
            Status::unavailable("A down again"),
            Arc::new(TagPicker("PA-fail")),
        );
        assert!(Arc::ptr_eq(&helper.last_picker().unwrap(), &pb));

        std::thread::sleep(Duration::from_millis(700));
        assert!(!b.was_shutdown.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn unknown_priority_name_reports_transient_failure() {
        let (helper, policy) = setup();
        let a = LeafControl::new();
        let mut children = FxHashMap::default();
        children.insert("A".to_string(), leaf_child(&a));
        let config = Arc::new(PriorityLbConfig::new(
            vec!["A".to_string(), "B".to_string()],
            children,
        ));
        let mut update = LbUpdate::with_addresses(Vec::new());
        update.config = Some(config);
        assert!(policy.update(update).is_err());
        let (state, status, _) = helper.last_state().unwrap();
        assert_eq!(state, ConnectivityState::TransientFailure);
        assert_eq!(status.code(), Code::InvalidArgument);
    }

    #[test]
    fn empty_priorities_report_transient_failure() {
        let (helper, policy) = setup();
        let config = Arc::new(PriorityLbConfig::new(Vec::new(), FxHashMap::default()));
        let mut update = LbUpdate::with_addresses(Vec::new());
        update.config = Some(config);
        policy.update(update).unwrap();
        let (state, _, _) = helper.last_state().unwrap();
        assert_eq!(state, ConnectivityState::TransientFailure);
    }
}

//! xDS cluster policy: wraps a child picker with drop-based load
//! shedding, circuit breaking and locality load reporting, and injects
//! certificate-provider bundles into the child's channel args.

use std::{
    any::Any,
    sync::{Arc, Mutex},
};

use super::{
    address::EndpointAddress,
    child_handler::ChildPolicyHandler,
    circuit::{CallCounter, CircuitBreakerRegistry},
    CallResult, CallTracker, ChannelArgs, ChildPolicyConfig, ConnectivityState, LbHelper,
    LbPolicy, LbPolicyArgs, LbUpdate, PickArgs, PickResult, Picker, Subchannel,
    SubchannelStateWatcher, TraceSeverity,
};
use crate::Status;

/// Registry name of the cluster policy.
pub const CLUSTER_IMPL_POLICY_NAME: &str = "xds_cluster_impl_experimental";

/// Applied when the cluster resource omits `max_concurrent_requests`.
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: u32 = 1024;

const PPM_SCALE: u32 = 1_000_000;

/// One EDS drop bucket.
pub struct DropCategory {
    /// User-visible category name.
    pub category: String,
    /// Drop rate in parts per million.
    pub parts_per_million: u32,
}

/// Drop policy from the cluster resource.
#[derive(Default)]
pub struct DropConfig {
    /// Categories, evaluated in order.
    pub categories: Vec<DropCategory>,
    /// Drop every pick without consulting the child.
    pub drop_all: bool,
}

/// Per-cluster TLS configuration naming cert provider instances.
pub struct TlsConfig {
    /// Root (CA) provider instance name.
    pub root_cert_provider_instance: Option<String>,
    /// Identity provider instance name.
    pub identity_cert_provider_instance: Option<String>,
}

/// An opaque certificate provider resolved from the bootstrap store.
pub trait CertificateProvider: Send + Sync {
    /// Instance name.
    fn name(&self) -> &str;
}

/// Resolves certificate provider instances by name.
pub trait CertificateProviderStore: Send + Sync {
    /// Look up a provider instance.
    fn get(&self, instance: &str) -> Option<Arc<dyn CertificateProvider>>;
}

/// The provider bundle injected into the child's channel args when the
/// cluster uses xDS credentials.
pub struct CertProviderBundle {
    /// Root provider, if configured.
    pub root: Option<Arc<dyn CertificateProvider>>,
    /// Identity provider, if configured.
    pub identity: Option<Arc<dyn CertificateProvider>>,
}

/// Sink for dropped-call accounting (LRS drop reports).
pub trait ClusterDropStats: Send + Sync {
    /// A pick was dropped without a category (circuit breaker).
    fn add_uncategorized_drops(&self);
    /// A pick was dropped by an EDS category.
    fn add_dropped_call(&self, category: &str);
}

/// Sink for per-locality call accounting.
pub trait LocalityStats: Send + Sync {
    /// A call started on a subchannel of this locality.
    fn add_call_started(&self);
    /// A call finished.
    fn add_call_finished(&self, failed: bool, named_metrics: &[(String, f64)]);
}

/// Connects the policy to the load-reporting service client.
pub trait LoadReporter: Send + Sync {
    /// Drop stats for a cluster.
    fn drop_stats(
        &self,
        lrs_server: &str,
        cluster: &str,
        eds_service_name: &str,
    ) -> Arc<dyn ClusterDropStats>;
    /// Locality stats for one locality of a cluster.
    fn locality_stats(
        &self,
        lrs_server: &str,
        cluster: &str,
        eds_service_name: &str,
        locality: &str,
    ) -> Arc<dyn LocalityStats>;
}

/// Parsed cluster policy configuration (an already-parsed cluster
/// resource; the xDS transport is an external collaborator).
pub struct XdsClusterImplConfig {
    /// Cluster name.
    pub cluster_name: String,
    /// EDS service name (may be empty).
    pub eds_service_name: String,
    /// LRS server to report loads to; `None` disables load reporting.
    pub lrs_server: Option<String>,
    /// Circuit-breaker threshold.
    pub max_concurrent_requests: u32,
    /// Drop policy.
    pub drop_config: Arc<DropConfig>,
    /// The wrapped child policy.
    pub child_policy: Arc<ChildPolicyConfig>,
    /// TLS configuration, when the channel uses xDS credentials.
    pub tls_config: Option<TlsConfig>,
}

/// The cluster policy. See the module docs.
pub struct XdsClusterImpl {
    inner: Arc<ClusterInner>,
}

struct ClusterInner {
    args: LbPolicyArgs,
    breakers: Arc<CircuitBreakerRegistry>,
    load_reporter: Option<Arc<dyn LoadReporter>>,
    cert_providers: Option<Arc<dyn CertificateProviderStore>>,
    state: Mutex<ClusterState>,
}

struct ClusterState {
    config: Option<Arc<XdsClusterImplConfig>>,
    child: Option<Arc<dyn LbPolicy>>,
    counter: Option<Arc<CallCounter>>,
    drop_stats: Option<Arc<dyn ClusterDropStats>>,
    shutdown: bool,
}

impl XdsClusterImpl {
    /// Build the policy. `breakers` is the shared circuit-breaker
    /// registry; `load_reporter` and `cert_providers` are optional
    /// collaborators.
    pub fn new(
        args: LbPolicyArgs,
        breakers: Arc<CircuitBreakerRegistry>,
        load_reporter: Option<Arc<dyn LoadReporter>>,
        cert_providers: Option<Arc<dyn CertificateProviderStore>>,
    ) -> Self {
        Self {
            inner: Arc::new(ClusterInner {
                args,
                breakers,
                load_reporter,
                cert_providers,
                state: Mutex::new(ClusterState {
                    config: None,
                    child: None,
                    counter: None,
                    drop_stats: None,
                    shutdown: false,
                }),
            }),
        }
    }
}

impl LbPolicy for XdsClusterImpl {
    fn name(&self) -> &'static str {
        CLUSTER_IMPL_POLICY_NAME
    }

    fn update(&self, update: LbUpdate) -> Result<(), Status> {
        let config = update
            .config
            .clone()
            .and_then(|c| c.downcast::<XdsClusterImplConfig>().ok())
            .ok_or_else(|| Status::invalid_argument("missing cluster impl config"))?;
        if config.cluster_name.is_empty() {
            let status = Status::invalid_argument("cluster impl config has no cluster name");
            self.inner.args.helper.update_state(
                ConnectivityState::TransientFailure,
                status.clone(),
                Arc::new(super::FailingPicker(status.clone())),
            );
            return Err(status);
        }

        let counter = self
            .inner
            .breakers
            .get_or_create(&config.cluster_name, &config.eds_service_name);
        let drop_stats = match (&config.lrs_server, &self.inner.load_reporter) {
            (Some(lrs), Some(reporter)) => Some(reporter.drop_stats(
                lrs,
                &config.cluster_name,
                &config.eds_service_name,
            )),
            _ => None,
        };

        let child = {
            let mut state = self.inner.state.lock().unwrap();
            if state.shutdown {
                return Ok(());
            }
            state.config = Some(config.clone());
            state.counter = Some(counter);
            state.drop_stats = drop_stats;
            state.child.clone()
        };
        let child = match child {
            Some(child) => child,
            None => {
                let helper = Arc::new(ClusterHelper {
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

        let mut forwarded = update;
        forwarded.config = Some(Arc::new(ChildPolicyConfig {
            policy_name: config.child_policy.policy_name.clone(),
            config: config.child_policy.config.clone(),
        }) as Arc<dyn Any + Send + Sync>);
        forwarded.args = self.inner.inject_cert_providers(&config, forwarded.args);
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
        let child = {
            let mut state = self.inner.state.lock().unwrap();
            state.shutdown = true;
            state.counter = None;
            state.drop_stats = None;
            state.child.take()
        };
        if let Some(child) = child {
            child.shutdown();
        }
    }
}

impl ClusterInner {
    fn child(&self) -> Option<Arc<dyn LbPolicy>> {
        self.state.lock().unwrap().child.clone()
    }

    fn inject_cert_providers(
        &self,
        config: &XdsClusterImplConfig,
        mut args: ChannelArgs,
    ) -> ChannelArgs {
        let (Some(tls), Some(store)) = (&config.tls_config, &self.cert_providers) else {
            return args;
        };
        let root = tls
            .root_cert_provider_instance
            .as_ref()
            .and_then(|name| store.get(name));
        let identity = tls
            .identity_cert_provider_instance
            .as_ref()
            .and_then(|name| store.get(name));
        if root.is_some() || identity.is_some() {
            args.set(Arc::new(CertProviderBundle { root, identity }));
        }
        args
    }
}

struct ClusterHelper {
    inner: std::sync::Weak<ClusterInner>,
}

impl LbHelper for ClusterHelper {
    fn create_subchannel(
        &self,
        address: &EndpointAddress,
        args: &ChannelArgs,
    ) -> Arc<dyn Subchannel> {
        let inner = self.inner.upgrade().expect("cluster policy destroyed");
        let wrapped = inner.args.helper.create_subchannel(address, args);
        // Attach the locality's stats ref so the picker can report call
        // starts and finishes for it.
        let locality_stats = {
            let state = inner.state.lock().unwrap();
            match (&state.config, &inner.load_reporter, &address.locality) {
                (Some(config), Some(reporter), Some(locality)) => {
                    config.lrs_server.as_ref().map(|lrs| {
                        reporter.locality_stats(
                            lrs,
                            &config.cluster_name,
                            &config.eds_service_name,
                            locality,
                        )
                    })
                }
                _ => None,
            }
        };
        Arc::new(StatsSubchannel {
            inner: wrapped,
            locality_stats,
        })
    }

    fn update_state(&self, state: ConnectivityState, status: Status, picker: Arc<dyn Picker>) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let (config, counter, drop_stats) = {
            let guard = inner.state.lock().unwrap();
            if guard.shutdown {
                return;
            }
            (
                guard.config.clone(),
                guard.counter.clone(),
                guard.drop_stats.clone(),
            )
        };
        let (Some(config), Some(counter)) = (config, counter) else {
            return;
        };
        let drop_all = config.drop_config.drop_all;
        let wrapped = Arc::new(ClusterPicker {
            child: picker,
            drop_config: config.drop_config.clone(),
            counter,
            max_concurrent_requests: config.max_concurrent_requests,
            drop_stats,
        });
        if drop_all {
            // Every pick is shed locally, so the cluster is "ready" no
            // matter what the child reports.
            inner
                .args
                .helper
                .update_state(ConnectivityState::Ready, Status::ok(), wrapped);
        } else {
            inner.args.helper.update_state(state, status, wrapped);
        }
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
            .expect("cluster policy destroyed")
            .args
            .helper
            .event_engine()
    }
}

/// Subchannel wrapper carrying its locality's stats ref.
struct StatsSubchannel {
    inner: Arc<dyn Subchannel>,
    locality_stats: Option<Arc<dyn LocalityStats>>,
}

impl Subchannel for StatsSubchannel {
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

// Uniform draw in [0, PPM_SCALE) for drop decisions. Drop rates do not
// need a shared or seedable RNG, just a cheap per-thread xorshift64*
// stream, so the state lives in a thread local next to its only user.
fn drop_draw_ppm() -> u32 {
    use std::{
        cell::Cell,
        collections::hash_map::RandomState,
        hash::BuildHasher,
    };

    thread_local! {
        static DRAW_STATE: Cell<u64> = Cell::new(
            // Seed from the thread id; xorshift state must be non-zero.
            RandomState::new().hash_one(std::thread::current().id()) | 1,
        );
    }
    DRAW_STATE.with(|state| {
        let mut x = state.get();
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        state.set(x);
        let bits = x.wrapping_mul(0x2545_f491_4f6c_dd1d) >> 32;
        // Lemire reduction of the high 32 bits onto the ppm range.
        (bits.wrapping_mul(PPM_SCALE as u64) >> 32) as u32
    })
}

struct ClusterPicker {
    child: Arc<dyn Picker>,
    drop_config: Arc<DropConfig>,
    counter: Arc<CallCounter>,
    max_concurrent_requests: u32,
    drop_stats: Option<Arc<dyn ClusterDropStats>>,
}

impl Picker for ClusterPicker {
    fn pick(&self, args: &PickArgs<'_>) -> PickResult {
        // EDS drop categories first; each draws independently.
        for category in &self.drop_config.categories {
            if drop_draw_ppm() < category.parts_per_million {
                if let Some(stats) = &self.drop_stats {
                    stats.add_dropped_call(&category.category);
                }
                return PickResult::Drop(Status::unavailable(format!(
                    "EDS-configured drop: {}",
                    category.category
                )));
            }
        }
        if self.drop_config.drop_all {
            if let Some(stats) = &self.drop_stats {
                stats.add_uncategorized_drops();
            }
            return PickResult::Drop(Status::unavailable("EDS-configured drop: drop_all"));
        }

        // The counter is incremented by the tracker at call start, not
        // here, so this check can overshoot by the number of racing
        // picks. That is accepted.
        if self.counter.load() >= self.max_concurrent_requests {
            if let Some(stats) = &self.drop_stats {
                stats.add_uncategorized_drops();
            }
            return PickResult::Drop(Status::unavailable("circuit breaker drop"));
        }

        match self.child.pick(args) {
            PickResult::Complete {
                subchannel,
                tracker,
            } => {
                let locality_stats = subchannel
                    .as_any()
                    .downcast_ref::<StatsSubchannel>()
                    .and_then(|s| s.locality_stats.clone());
                PickResult::Complete {
                    subchannel,
                    tracker: Some(Arc::new(ClusterCallTracker {
                        counter: self.counter.clone(),
                        locality_stats,
                        inner: tracker,
                    })),
                }
            }
            other => other,
        }
    }
}

struct ClusterCallTracker {
    counter: Arc<CallCounter>,
    locality_stats: Option<Arc<dyn LocalityStats>>,
    inner: Option<Arc<dyn CallTracker>>,
}

impl CallTracker for ClusterCallTracker {
    fn start(&self) {
        self.counter.increment();
        if let Some(stats) = &self.locality_stats {
            stats.add_call_started();
        }
        if let Some(inner) = &self.inner {
            inner.start();
        }
    }

    fn finish(&self, result: &CallResult) {
        self.counter.decrement();
        if let Some(stats) = &self.locality_stats {
            stats.add_call_finished(result.failed, &result.named_metrics);
        }
        if let Some(inner) = &self.inner {
            inner.finish(result);
        }
    }
}

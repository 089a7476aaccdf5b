//! Graceful-switch wrapper around a single child policy.
//!
//! When an update names a different policy than the one in use, the new
//! policy is built as `pending` and warmed up in the background; the
//! channel keeps using the old policy's pickers until the pending child
//! first reports a state other than CONNECTING, at which point it is
//! swapped in atomically and the old child is orphaned.

use std::sync::{Arc, Mutex, Weak};

use super::{
    ChildPolicyConfig, ConnectivityState, LbHelper, LbPolicy, LbPolicyArgs, LbUpdate, Picker,
    TraceSeverity,
};
use crate::Status;

/// Wraps any single child policy behind the [`LbPolicy`] contract.
pub struct ChildPolicyHandler {
    inner: Arc<HandlerInner>,
}

struct HandlerInner {
    args: LbPolicyArgs,
    state: Mutex<HandlerState>,
}

struct HandlerState {
    current: Option<Child>,
    pending: Option<Child>,
    shutdown: bool,
}

struct Child {
    name: String,
    policy: Arc<dyn LbPolicy>,
    helper: Arc<ChildHelper>,
}

enum Role {
    Current,
    Pending,
    Stale,
}

impl ChildPolicyHandler {
    /// Build an empty handler; the first update instantiates the child.
    pub fn new(args: LbPolicyArgs) -> Self {
        Self {
            inner: Arc::new(HandlerInner {
                args,
                state: Mutex::new(HandlerState {
                    current: None,
                    pending: None,
                    shutdown: false,
                }),
            }),
        }
    }

    fn make_child(&self, name: &str) -> Result<Child, Status> {
        let helper = Arc::new(ChildHelper {
            handler: Arc::downgrade(&self.inner),
        });
        let child_args = LbPolicyArgs {
            helper: helper.clone() as Arc<dyn LbHelper>,
            serializer: self.inner.args.serializer.clone(),
            registry: self.inner.args.registry.clone(),
        };
        let policy = self
            .inner
            .args
            .registry
            .create(name, child_args)
            .ok_or_else(|| {
                Status::invalid_argument(format!("unknown LB policy {name:?}"))
            })?;
        Ok(Child {
            name: name.to_string(),
            policy,
            helper,
        })
    }
}

impl LbPolicy for ChildPolicyHandler {
    fn name(&self) -> &'static str {
        "child_policy_handler"
    }

    fn update(&self, update: LbUpdate) -> Result<(), Status> {
        let config = update
            .config
            .clone()
            .and_then(|c| c.downcast::<ChildPolicyConfig>().ok())
            .ok_or_else(|| Status::invalid_argument("missing child policy config"))?;

        // Updates arrive on the work serializer, so the decision taken
        // here cannot race another update. Child construction and trace
        // emission stay outside the lock.
        enum Decision {
            ToCurrent,
            ToPending,
            CreateCurrent,
            CreatePending,
            ReplacePending,
        }
        let decision = {
            let state = self.inner.state.lock().unwrap();
            if state.shutdown {
                return Ok(());
            }
            if state.current.is_none() {
                Decision::CreateCurrent
            } else if let Some(pending) = &state.pending {
                if pending.name == config.policy_name {
                    Decision::ToPending
                } else {
                    Decision::ReplacePending
                }
            } else if state.current.as_ref().unwrap().name != config.policy_name {
                Decision::CreatePending
            } else {
                Decision::ToCurrent
            }
        };

        let target = match decision {
            Decision::ToCurrent => {
                let state = self.inner.state.lock().unwrap();
                state.current.as_ref().unwrap().policy.clone()
            }
            Decision::ToPending => {
                let state = self.inner.state.lock().unwrap();
                state.pending.as_ref().unwrap().policy.clone()
            }
            Decision::CreateCurrent => {
                let child = self.make_child(&config.policy_name)?;
                let policy = child.policy.clone();
                self.inner.state.lock().unwrap().current = Some(child);
                self.inner.args.helper.add_trace_event(
                    TraceSeverity::Info,
                    &format!("created child policy {:?}", config.policy_name),
                );
                policy
            }
            Decision::CreatePending => {
                let child = self.make_child(&config.policy_name)?;
                let policy = child.policy.clone();
                self.inner.state.lock().unwrap().pending = Some(child);
                self.inner.args.helper.add_trace_event(
                    TraceSeverity::Info,
                    &format!("starting graceful switch to {:?}", config.policy_name),
                );
                policy
            }
            Decision::ReplacePending => {
                // The target changed again before the previous pending
                // child got healthy; replace it.
                let child = self.make_child(&config.policy_name)?;
                let policy = child.policy.clone();
                let discarded = self.inner.state.lock().unwrap().pending.replace(child);
                self.inner.args.helper.add_trace_event(
                    TraceSeverity::Info,
                    &format!("replacing pending policy with {:?}", config.policy_name),
                );
                if let Some(discarded) = discarded {
                    discarded.policy.shutdown();
                }
                policy
            }
        };

        let mut forwarded = update;
        forwarded.config = config.config.clone();
        target.update(forwarded)
    }

    fn exit_idle(&self) {
        let (current, pending) = self.inner.snapshot();
        if let Some(policy) = current {
            policy.exit_idle();
        }
        if let Some(policy) = pending {
            policy.exit_idle();
        }
    }

    fn reset_backoff(&self) {
        let (current, pending) = self.inner.snapshot();
        if let Some(policy) = current {
            policy.reset_backoff();
        }
        if let Some(policy) = pending {
            policy.reset_backoff();
        }
    }

    fn shutdown(&self) {
        let (current, pending) = {
            let mut state = self.inner.state.lock().unwrap();
            state.shutdown = true;
            (state.current.take(), state.pending.take())
        };
        if let Some(child) = current {
            child.policy.shutdown();
        }
        if let Some(child) = pending {
            child.policy.shutdown();
        }
    }
}

impl HandlerInner {
    fn snapshot(&self) -> (Option<Arc<dyn LbPolicy>>, Option<Arc<dyn LbPolicy>>) {
        let state = self.state.lock().unwrap();
        (
            state.current.as_ref().map(|c| c.policy.clone()),
            state.pending.as_ref().map(|c| c.policy.clone()),
        )
    }

    fn role_of(state: &HandlerState, helper: &ChildHelper) -> Role {
        if let Some(pending) = &state.pending {
            if std::ptr::eq(Arc::as_ptr(&pending.helper), helper) {
                return Role::Pending;
            }
        }
        if let Some(current) = &state.current {
            if std::ptr::eq(Arc::as_ptr(&current.helper), helper) {
                return Role::Current;
            }
        }
        Role::Stale
    }
}

struct ChildHelper {
    handler: Weak<HandlerInner>,
}

impl LbHelper for ChildHelper {
    fn create_subchannel(
        &self,
        address: &super::address::EndpointAddress,
        args: &super::ChannelArgs,
    ) -> Arc<dyn super::Subchannel> {
        let inner = self.handler.upgrade().expect("handler destroyed");
        inner.args.helper.create_subchannel(address, args)
    }

    fn update_state(&self, state: ConnectivityState, status: Status, picker: Arc<dyn Picker>) {
        let Some(inner) = self.handler.upgrade() else {
            return;
        };
        enum Action {
            Forward,
            Suppress,
            Promote(Child),
        }
        let action = {
            let mut guard = inner.state.lock().unwrap();
            if guard.shutdown {
                Action::Suppress
            } else {
                match HandlerInner::role_of(&guard, self) {
                    Role::Current => Action::Forward,
                    Role::Stale => Action::Suppress,
                    Role::Pending => {
                        if state == ConnectivityState::Connecting {
                            // Keep the channel on the old policy while
                            // the pending one warms up.
                            Action::Suppress
                        } else {
                            let pending = guard.pending.take().unwrap();
                            let old = guard.current.replace(pending);
                            Action::Promote(old.expect("pending without current"))
                        }
                    }
                }
            }
        };
        match action {
            Action::Suppress => {}
            Action::Forward => inner.args.helper.update_state(state, status, picker),
            Action::Promote(old) => {
                inner.args.helper.add_trace_event(
                    TraceSeverity::Info,
                    &format!("promoting pending policy over {:?}", old.name),
                );
                old.policy.shutdown();
                inner.args.helper.update_state(state, status, picker);
            }
        }
    }

    fn request_reresolution(&self) {
        let Some(inner) = self.handler.upgrade() else {
            return;
        };
        // Only the most recent child may trigger re-resolution; an old
        // policy's stale cache invalidations would loop.
        let newest = {
            let state = inner.state.lock().unwrap();
            match HandlerInner::role_of(&state, self) {
                Role::Pending => true,
                Role::Current => state.pending.is_none(),
                Role::Stale => false,
            }
        };
        if newest {
            inner.args.helper.request_reresolution();
        }
    }

    fn add_trace_event(&self, severity: TraceSeverity, message: &str) {
        if let Some(inner) = self.handler.upgrade() {
            inner.args.helper.add_trace_event(severity, message);
        }
    }

    fn event_engine(&self) -> Arc<crate::exec::TimerDriver> {
        self.handler
            .upgrade()
            .expect("handler destroyed")
            .args
            .helper
            .event_engine()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::{
        exec::{TimerDriver, WorkSerializer},
        lb::{PolicyRegistry, QueuePicker},
    };

    struct RecordingHelper {
        timer: Arc<TimerDriver>,
        states: Mutex<Vec<(ConnectivityState, String)>>,
        reresolutions: Mutex<usize>,
    }

    impl RecordingHelper {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                timer: TimerDriver::new(),
                states: Mutex::new(Vec::new()),
                reresolutions: Mutex::new(0),
            })
        }

        fn last_state(&self) -> Option<(ConnectivityState, String)> {
            self.states.lock().unwrap().last().cloned()
        }
    }

    impl LbHelper for RecordingHelper {
        fn create_subchannel(
            &self,
            _address: &crate::lb::address::EndpointAddress,
            _args: &crate::lb::ChannelArgs,
        ) -> Arc<dyn crate::lb::Subchannel> {
            unimplemented!("not used by these tests")
        }

        fn update_state(
            &self,
            state: ConnectivityState,
            status: Status,
            _picker: Arc<dyn Picker>,
        ) {
            self.states
                .lock()
                .unwrap()
                .push((state, status.message().to_string()));
        }

        fn request_reresolution(&self) {
            *self.reresolutions.lock().unwrap() += 1;
        }

        fn add_trace_event(&self, _severity: TraceSeverity, _message: &str) {}

        fn event_engine(&self) -> Arc<TimerDriver> {
            self.timer.clone()
        }
    }

    // A child policy that reports a configured state on every update and
    // requests re-resolution on exit_idle, so the test can observe
    // filtering.
    struct StubPolicy {
        name: &'static str,
        helper: Arc<dyn LbHelper>,
        report: ConnectivityState,
    }

    impl LbPolicy for StubPolicy {
        fn name(&self) -> &'static str {
            self.name
        }

        fn update(&self, _update: LbUpdate) -> Result<(), Status> {
            self.helper.update_state(
                self.report,
                Status::new(crate::Code::Ok, self.name),
                Arc::new(QueuePicker),
            );
            Ok(())
        }

        fn exit_idle(&self) {
            self.helper.request_reresolution();
        }

        fn reset_backoff(&self) {}

        fn shutdown(&self) {}
    }

    fn register_stub(
        registry: &PolicyRegistry,
        name: &'static str,
        report: ConnectivityState,
    ) {
        registry.register(
            name,
            Arc::new(move |args: LbPolicyArgs| {
                Arc::new(StubPolicy {
                    name,
                    helper: args.helper,
                    report,
                }) as Arc<dyn LbPolicy>
            }),
        );
    }

    fn update_for(policy_name: &str) -> LbUpdate {
        let mut update = LbUpdate::with_addresses(Vec::new());
        update.config = Some(Arc::new(ChildPolicyConfig {
            policy_name: policy_name.to_string(),
            config: None,
        }));
        update
    }

    #[test]
    fn graceful_switch_waits_for_non_connecting() {
        let helper = RecordingHelper::new();
        let registry = PolicyRegistry::new();
        register_stub(&registry, "ready_policy", ConnectivityState::Ready);
        register_stub(&registry, "warming_policy", ConnectivityState::Connecting);
        register_stub(&registry, "failing_policy", ConnectivityState::TransientFailure);

        let handler = ChildPolicyHandler::new(LbPolicyArgs {
            helper: helper.clone(),
            serializer: WorkSerializer::new(),
            registry: registry.clone(),
        });

        handler.update(update_for("ready_policy")).unwrap();
        assert_eq!(
            helper.last_state().unwrap(),
            (ConnectivityState::Ready, "ready_policy".to_string())
        );

        // Pending child stuck CONNECTING: channel keeps the old state.
        handler.update(update_for("warming_policy")).unwrap();
        assert_eq!(
            helper.last_state().unwrap(),
            (ConnectivityState::Ready, "ready_policy".to_string())
        );

        // Replacing the pending child with one that reports TF swaps it
        // in on the first report.
        handler.update(update_for("failing_policy")).unwrap();
        assert_eq!(
            helper.last_state().unwrap(),
            (
                ConnectivityState::TransientFailure,
                "failing_policy".to_string()
            )
        );
    }

    #[test]
    fn reresolution_only_from_most_recent_child() {
        let helper = RecordingHelper::new();
        let registry = PolicyRegistry::new();
        register_stub(&registry, "ready_policy", ConnectivityState::Ready);
        register_stub(&registry, "warming_policy", ConnectivityState::Connecting);

        let handler = ChildPolicyHandler::new(LbPolicyArgs {
            helper: helper.clone(),
            serializer: WorkSerializer::new(),
            registry: registry.clone(),
        });
        handler.update(update_for("ready_policy")).unwrap();
        handler.update(update_for("warming_policy")).unwrap();

        // exit_idle fans out to both children; only the pending (most
        // recent) one's re-resolution request passes the filter.
        handler.exit_idle();
        assert_eq!(*helper.reresolutions.lock().unwrap(), 1);
    }
}

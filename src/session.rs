//! The session: owner of the in-memory task graph and the bridge between
//! rule invocations and the persistent cache.
//!
//! A session is opened, drives evaluation through [`Session::run`], and is
//! closed (explicitly or on drop), cancelling whatever never got to run.
//! Opening a second session on the same thread fails; the ambient
//! "a session is active here" marker is a thread-local flag, and the
//! context routed into rule bodies is an explicit [`TaskCtx`] parameter.

use std::cell::Cell;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use petgraph::graph::NodeIndex;
use tracing::{debug, warn};

use crate::cache::Cache;
use crate::config::Config;
use crate::error::{Error, ValueError};
use crate::executor::{ClaimWait, DriverMsg};
use crate::fingerprint::{fingerprint, task_fingerprint};
use crate::future::State;
use crate::graph::{Dep, Fut, TaskGraph};
use crate::hash::Hash;
use crate::plugin::{Event, Plugin, TaskView};
use crate::rule::Rule;
use crate::task::Task;
use crate::value::Value;

thread_local! {
    static SESSION_ACTIVE: Cell<bool> = const { Cell::new(false) };
}

pub(crate) struct SessionState {
    pub graph: TaskGraph,
    /// Tasks suspended on a foreign cache claim, with their poll schedule.
    pub claim_waits: Vec<ClaimWait>,
    /// Fingerprints whose cache claim this session holds.
    pub held_claims: HashSet<Hash>,
    pub last_heartbeat: Instant,
    /// Worker-pool bodies currently blocked in a mid-body demand.
    pub parked: usize,
}

/// Collects what [`Session::run`] should drive: a single future or a
/// collection of them.
pub trait IntoDemand {
    fn demanded(&self) -> Vec<Fut>;

    fn is_single(&self) -> bool {
        false
    }
}

impl IntoDemand for Fut {
    fn demanded(&self) -> Vec<Fut> {
        vec![*self]
    }

    fn is_single(&self) -> bool {
        true
    }
}

impl IntoDemand for Vec<Fut> {
    fn demanded(&self) -> Vec<Fut> {
        self.clone()
    }
}

impl IntoDemand for &[Fut] {
    fn demanded(&self) -> Vec<Fut> {
        self.to_vec()
    }
}

impl<const N: usize> IntoDemand for [Fut; N] {
    fn demanded(&self) -> Vec<Fut> {
        self.to_vec()
    }
}

pub struct SessionBuilder {
    plugins: Vec<Box<dyn Plugin>>,
    cache: Option<Arc<Cache>>,
    config: Config,
}

impl SessionBuilder {
    /// Install a plugin; handlers run in registration order.
    pub fn plugin(mut self, plugin: impl Plugin + 'static) -> Self {
        self.plugins.push(Box::new(plugin));
        self
    }

    /// Attach a persistent cache.
    pub fn cache(mut self, cache: impl Into<Arc<Cache>>) -> Self {
        self.cache = Some(cache.into());
        self
    }

    /// Run rule bodies on a worker pool of `n` threads. Zero (the default)
    /// keeps the session a single-threaded cooperative driver.
    pub fn workers(mut self, n: usize) -> Self {
        self.config.workers = n;
        self
    }

    pub fn task_timeout(mut self, budget: std::time::Duration) -> Self {
        self.config.task_timeout = Some(budget);
        self
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Open the session, installing it as this thread's ambient context.
    pub fn open(self) -> Result<Session, Error> {
        SESSION_ACTIVE.with(|active| {
            if active.get() {
                return Err(Error::NestedSession);
            }
            active.set(true);
            Ok(())
        })?;

        let session = Session {
            state: Mutex::new(SessionState {
                graph: TaskGraph::new(),
                claim_waits: Vec::new(),
                held_claims: HashSet::new(),
                last_heartbeat: Instant::now(),
                parked: 0,
            }),
            plugins: self.plugins,
            cache: self.cache,
            config: self.config,
            closed: AtomicBool::new(false),
        };

        let opened = session
            .emit_session(Event::SessionOpen)
            .and_then(|()| session.emit_session(Event::PostEnter));
        match opened {
            Ok(()) => {
                debug!("session open");
                Ok(session)
            }
            Err(err) => {
                let _ = session.shutdown();
                Err(err)
            }
        }
    }
}

pub struct Session {
    pub(crate) state: Mutex<SessionState>,
    pub(crate) plugins: Vec<Box<dyn Plugin>>,
    pub(crate) cache: Option<Arc<Cache>>,
    pub(crate) config: Config,
    closed: AtomicBool,
}

impl Session {
    /// Open a session with default settings and no cache.
    pub fn open() -> Result<Session, Error> {
        Session::builder().open()
    }

    pub fn builder() -> SessionBuilder {
        SessionBuilder {
            plugins: Vec::new(),
            cache: None,
            config: Config::default(),
        }
    }

    /// Call a rule: canonicalise the arguments, dedup against the graph and
    /// return a handle to the (possibly pre-existing) task.
    pub fn task(
        &self,
        rule: &Rule,
        args: impl IntoIterator<Item = Value>,
    ) -> Result<Fut, Error> {
        self.create_task(None, rule, args.into_iter().collect())
    }

    /// Drive evaluation until the demanded futures resolve and return their
    /// substituted values. A single future yields its value directly; a
    /// collection yields a sequence in demand order.
    pub fn run(&self, demand: impl IntoDemand) -> Result<Value, Error> {
        let futs = demand.demanded();
        self.drive(&futs)?;

        let state = self.state.lock().unwrap();
        let mut values = Vec::with_capacity(futs.len());
        for fut in &futs {
            let future = &state.graph.task(fut.index).future;
            match future.state() {
                State::Done => {
                    values.push(future.result().cloned().expect("done future has a result"))
                }
                _ => return Err(future.error().cloned().unwrap_or(Error::Cancelled)),
            }
        }
        drop(state);

        if demand.is_single() {
            Ok(values.pop().expect("single demand"))
        } else {
            Ok(Value::Seq(values))
        }
    }

    /// Number of tasks created in this session so far.
    pub fn task_count(&self) -> usize {
        self.state.lock().unwrap().graph.task_count()
    }

    /// Handles to every task created in this session.
    pub fn all_tasks(&self) -> Vec<Fut> {
        let state = self.state.lock().unwrap();
        state
            .graph
            .node_indices()
            .into_iter()
            .map(|index| Fut {
                index,
                hash: state.graph.task(index).fingerprint,
            })
            .collect()
    }

    /// Tasks created by the given task's body, in creation order.
    pub fn side_tasks_of(&self, fut: Fut) -> Vec<Fut> {
        let state = self.state.lock().unwrap();
        state
            .graph
            .task(fut.index)
            .side_tasks
            .iter()
            .filter_map(|hash| {
                state.graph.get(hash).map(|index| Fut { index, hash: *hash })
            })
            .collect()
    }

    /// Close the session, cancelling pending tasks and releasing any held
    /// cache claims. Dropping the session does the same.
    pub fn close(self) -> Result<(), Error> {
        self.shutdown()
    }

    pub(crate) fn create_task(
        &self,
        caller: Option<NodeIndex>,
        rule: &Rule,
        args: Vec<Value>,
    ) -> Result<Fut, Error> {
        let input = Value::Seq(args);
        let input_hash = fingerprint(&input);
        let hash = task_fingerprint(rule.identity(), &input_hash);

        let mut state = self.state.lock().unwrap();

        if let Some(index) = state.graph.get(&hash) {
            if let Some(caller) = caller {
                let caller_task = state.graph.task_mut(caller);
                if !caller_task.side_tasks.contains(&hash) {
                    caller_task.side_tasks.push(hash);
                }
            }
            return Ok(Fut { index, hash });
        }

        // Embedded futures must be tasks already registered here.
        let mut children = Vec::new();
        for child_hash in input.refs() {
            match state.graph.get(&child_hash) {
                Some(child) => children.push(child),
                None => return Err(ValueError::UnresolvedRef(child_hash).into()),
            }
        }

        let (index, _) =
            state
                .graph
                .get_or_insert(hash, || Task::new(rule, input, input_hash, hash));
        let mut failed_child = None;
        for child in children {
            state.graph.add_dependency(index, child, Dep::Input);
            if matches!(
                state.graph.task(child).future.state(),
                State::Errored | State::Cancelled
            ) {
                failed_child = failed_child.or(Some(child));
            }
        }
        if let Some(caller) = caller {
            state.graph.task_mut(caller).side_tasks.push(hash);
        }
        debug!(task = %state.graph.task(index).label, fingerprint = %hash.tag(), "task registered");

        self.emit_task(&mut state, Event::TaskCreated, index)?;
        if let Some(child) = failed_child {
            // An input dependency already failed; this task can never run.
            let error = Error::DependencyFailed {
                label: state.graph.task(index).label.clone(),
                dep: state.graph.task(child).label.clone(),
                source: Arc::new(
                    state
                        .graph
                        .task(child)
                        .future
                        .error()
                        .cloned()
                        .unwrap_or(Error::Cancelled),
                ),
            };
            self.fail_task(&mut state, index, error)?;
        } else if state.graph.settle(index) {
            self.emit_task(&mut state, Event::TaskReady, index)?;
        }
        Ok(Fut { index, hash })
    }

    pub(crate) fn emit_task(
        &self,
        state: &mut SessionState,
        event: Event,
        index: NodeIndex,
    ) -> Result<(), Error> {
        for plugin in &self.plugins {
            if !plugin.subscriptions().contains(&event) {
                continue;
            }
            let mut view = TaskView {
                task: state.graph.task_mut(index),
            };
            let handled = match event {
                Event::TaskCreated => plugin.on_task_created(&mut view),
                Event::TaskReady => plugin.on_task_ready(&mut view),
                Event::TaskRunStart => plugin.on_task_run_start(&mut view),
                Event::TaskRunEnd => plugin.on_task_run_end(&mut view),
                Event::TaskDone => plugin.on_task_done(&mut view),
                Event::TaskError => plugin.on_task_error(&mut view),
                _ => Ok(()),
            };
            handled.map_err(|err| Error::PluginError {
                plugin: plugin.name().to_string(),
                event,
                source: Arc::new(err),
            })?;
        }
        Ok(())
    }

    pub(crate) fn emit_session(&self, event: Event) -> Result<(), Error> {
        for plugin in &self.plugins {
            if !plugin.subscriptions().contains(&event) {
                continue;
            }
            let handled = match event {
                Event::SessionOpen => plugin.on_session_open(),
                Event::PostEnter => plugin.on_post_enter(),
                Event::PreExit => plugin.on_pre_exit(),
                Event::SessionClose => plugin.on_session_close(),
                _ => Ok(()),
            };
            handled.map_err(|err| Error::PluginError {
                plugin: plugin.name().to_string(),
                event,
                source: Arc::new(err),
            })?;
        }
        Ok(())
    }

    fn shutdown(&self) -> Result<(), Error> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let pre_exit = self.emit_session(Event::PreExit);

        {
            let mut state = self.state.lock().unwrap();
            let mut never_ran = 0usize;
            for index in state.graph.node_indices() {
                let task = state.graph.task_mut(index);
                if task.future.state().is_terminal() {
                    continue;
                }
                if !task.has_run {
                    never_ran += 1;
                }
                task.future.cancel();
            }
            if let Some(cache) = &self.cache {
                for hash in state.held_claims.drain().collect::<Vec<_>>() {
                    let _ = cache.release(&hash);
                }
            }
            if self.config.warn_unexecuted && never_ran > 0 {
                warn!(count = never_ran, "tasks were created but never ran");
            }
        }

        SESSION_ACTIVE.with(|active| active.set(false));
        debug!("session closed");

        self.emit_session(Event::SessionClose).and(pre_exit)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

/// Execution context threaded into a running rule body.
///
/// Rule invocations made through the context are captured as side tasks of
/// the running task; [`demand`](TaskCtx::demand) is the body's only
/// suspension point.
pub struct TaskCtx<'s> {
    session: &'s Session,
    node: NodeIndex,
    port: Option<crossbeam_channel::Sender<DriverMsg>>,
}

impl<'s> TaskCtx<'s> {
    pub(crate) fn new(
        session: &'s Session,
        node: NodeIndex,
        port: Option<crossbeam_channel::Sender<DriverMsg>>,
    ) -> Self {
        TaskCtx { session, node, port }
    }

    /// Call a rule from inside a running body. The created task is recorded
    /// as a side task of the caller.
    pub fn spawn(
        &mut self,
        rule: &Rule,
        args: impl IntoIterator<Item = Value>,
    ) -> Result<Fut, Error> {
        self.session
            .create_task(Some(self.node), rule, args.into_iter().collect())
    }

    /// Await a future: suspend until it reaches a terminal state, then
    /// return its substituted value or the error that terminated it.
    pub fn demand(&mut self, fut: Fut) -> Result<Value, Error> {
        {
            let state = self.session.state.lock().unwrap();
            let future = &state.graph.task(fut.index).future;
            match future.state() {
                State::Done => {
                    return Ok(future.result().cloned().expect("done future has a result"))
                }
                other if other.is_terminal() => {
                    return Err(future.error().cloned().unwrap_or(Error::Cancelled))
                }
                _ => {}
            }
        }

        match &self.port {
            // Worker pool: park this body until the driver settles the target.
            Some(port) => {
                let (waiter, resume) = crossbeam_channel::bounded(1);
                port.send(DriverMsg::Demand {
                    target: fut,
                    waiter,
                })
                .map_err(|_| Error::Cancelled)?;
                resume.recv().map_err(|_| Error::Cancelled)?
            }
            // Cooperative driver: re-enter the scheduler until the target
            // settles, running other ready tasks along the way.
            None => {
                self.session.drive_serial(&[fut])?;
                let state = self.session.state.lock().unwrap();
                let future = &state.graph.task(fut.index).future;
                match future.state() {
                    State::Done => {
                        Ok(future.result().cloned().expect("done future has a result"))
                    }
                    _ => Err(future.error().cloned().unwrap_or(Error::Cancelled)),
                }
            }
        }
    }
}

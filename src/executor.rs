//! The scheduler that drives a session's task graph to quiescence.
//!
//! The default driver is single-threaded and cooperative: it pops ready
//! tasks and runs their bodies inline; a body that demands an unresolved
//! future re-enters the driver until the target settles. In worker-pool
//! mode bodies run on scoped worker threads and report back over a
//! channel; graph mutations stay serialised behind the session lock, and a
//! mid-body demand parks its worker until the driver settles the target.
//!
//! The only suspension points are demands and the cache-claim backoff.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::RecvTimeoutError;
use petgraph::graph::NodeIndex;
use tracing::{debug, warn};

use crate::cache::ClaimOutcome;
use crate::error::{Error, ValueError};
use crate::future::{State, Waiter};
use crate::graph::{Dep, Fut};
use crate::hash::Hash;
use crate::plugin::Event;
use crate::rule::RuleBody;
use crate::session::{Session, SessionState, TaskCtx};
use crate::value::Value;

/// How long the driver sleeps when the only possible progress is a foreign
/// worker publishing a result.
const MAX_IDLE_SLEEP: Duration = Duration::from_millis(50);
/// Poll interval of the pool driver's message loop.
const POOL_TICK: Duration = Duration::from_millis(5);

/// Messages routed from worker threads back to the driver.
pub(crate) enum DriverMsg {
    Done {
        node: NodeIndex,
        outcome: anyhow::Result<Value>,
    },
    Demand {
        target: Fut,
        waiter: Waiter,
    },
}

/// A task suspended on a foreign cache claim.
pub(crate) struct ClaimWait {
    pub node: NodeIndex,
    pub due: Instant,
    pub delay: Duration,
}

pub(crate) enum Prepared {
    /// The body must run with these substituted arguments.
    Run { body: RuleBody, args: Vec<Value> },
    /// Adopted from the cache, or parked on a claim; nothing to run.
    Settled,
}

impl Session {
    pub(crate) fn drive(&self, roots: &[Fut]) -> Result<(), Error> {
        if self.config.workers > 0 {
            self.drive_pool(roots)
        } else {
            self.drive_serial(roots)
        }
    }

    fn roots_settled(&self, roots: &[Fut]) -> bool {
        let state = self.state.lock().unwrap();
        roots
            .iter()
            .all(|fut| state.graph.task(fut.index).future.state().is_terminal())
    }

    /// The cooperative driver. Also the re-entry point for a body that
    /// demands an unresolved future: the nested drive runs other ready
    /// tasks until the target settles.
    pub(crate) fn drive_serial(&self, roots: &[Fut]) -> Result<(), Error> {
        loop {
            self.tick()?;
            if self.roots_settled(roots) {
                return Ok(());
            }

            let next = { self.state.lock().unwrap().graph.pop_ready() };
            if let Some(index) = next {
                match self.prepare_ready(index)? {
                    Prepared::Run { body, args } => {
                        let mut ctx = TaskCtx::new(self, index, None);
                        let outcome = body(&mut ctx, &args);
                        self.finish_run(index, outcome)?;
                    }
                    Prepared::Settled => {}
                }
                continue;
            }

            // Nothing ready: either a foreign claim will publish, or the
            // graph is stuck.
            let next_due = {
                let state = self.state.lock().unwrap();
                state.claim_waits.iter().map(|wait| wait.due).min()
            };
            match next_due {
                Some(due) => {
                    let now = Instant::now();
                    if due > now {
                        std::thread::sleep((due - now).min(MAX_IDLE_SLEEP));
                    }
                }
                None => {
                    let pending = self.state.lock().unwrap().graph.pending_count();
                    return Err(Error::Deadlock { pending });
                }
            }
        }
    }

    /// The worker-pool driver. Bodies run on scoped threads; only the
    /// driver thread mutates scheduling decisions, so a parked body never
    /// starves the graph — parked workers simply do not count against the
    /// configured capacity.
    fn drive_pool(&self, roots: &[Fut]) -> Result<(), Error> {
        let (tx, rx) = crossbeam_channel::unbounded::<DriverMsg>();

        std::thread::scope(move |scope| -> Result<(), Error> {
            let mut inflight = 0usize;
            let result = 'drive: loop {
                if let Err(err) = self.tick() {
                    break 'drive Err(self.abort_evaluation(err));
                }

                // Spawn ready bodies while unparked capacity remains; a
                // parked body does not count against the configured width.
                loop {
                    let parked = self.state.lock().unwrap().parked;
                    if inflight.saturating_sub(parked) >= self.config.workers {
                        break;
                    }
                    let next = { self.state.lock().unwrap().graph.pop_ready() };
                    let Some(index) = next else { break };
                    match self.prepare_ready(index) {
                        Ok(Prepared::Settled) => {}
                        Ok(Prepared::Run { body, args }) => {
                            inflight += 1;
                            let port = tx.clone();
                            scope.spawn(move || {
                                let mut ctx =
                                    TaskCtx::new(self, index, Some(port.clone()));
                                let outcome = body(&mut ctx, &args);
                                let _ = port.send(DriverMsg::Done {
                                    node: index,
                                    outcome,
                                });
                            });
                        }
                        Err(err) => break 'drive Err(self.abort_evaluation(err)),
                    }
                }

                {
                    let state = self.state.lock().unwrap();
                    let settled = roots
                        .iter()
                        .all(|fut| state.graph.task(fut.index).future.state().is_terminal());
                    if settled && inflight == 0 {
                        break 'drive Ok(());
                    }
                    // Stuck: every worker is parked in a demand, nothing is
                    // ready and no foreign claim can publish.
                    if !settled
                        && inflight == state.parked
                        && state.claim_waits.is_empty()
                        && state.graph.ready_len() == 0
                    {
                        let pending = state.graph.pending_count();
                        drop(state);
                        break 'drive Err(self.abort_evaluation(Error::Deadlock { pending }));
                    }
                }

                match rx.recv_timeout(POOL_TICK) {
                    Ok(DriverMsg::Done { node, outcome }) => {
                        inflight -= 1;
                        if let Err(err) = self.finish_run(node, outcome) {
                            break 'drive Err(self.abort_evaluation(err));
                        }
                    }
                    Ok(DriverMsg::Demand { target, waiter }) => {
                        let mut state = self.state.lock().unwrap();
                        let terminal =
                            state.graph.task(target.index).future.state().is_terminal();
                        state
                            .graph
                            .task_mut(target.index)
                            .future
                            .register_waiter(waiter);
                        if !terminal {
                            state.parked += 1;
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break 'drive Ok(()),
                }
            };
            // Drop the channel before the scope joins its threads, so a
            // worker still blocked in a demand unblocks with a disconnect
            // instead of waiting on a driver that is gone.
            drop(rx);
            drop(tx);
            result
        })
    }

    /// Cancel everything still pending so parked workers unblock, then hand
    /// the error back. Used when the pool driver must abandon evaluation.
    fn abort_evaluation(&self, err: Error) -> Error {
        let mut state = self.state.lock().unwrap();
        for index in state.graph.node_indices() {
            let task = state.graph.task_mut(index);
            if !task.future.state().is_terminal() {
                task.future.cancel();
            }
        }
        state.parked = 0;
        state.claim_waits.clear();
        err
    }

    /// Heartbeats, per-task budgets and due claim polls.
    fn tick(&self) -> Result<(), Error> {
        {
            let mut state = self.state.lock().unwrap();
            if let Some(cache) = &self.cache {
                if !state.held_claims.is_empty()
                    && state.last_heartbeat.elapsed() >= self.config.heartbeat_interval
                {
                    cache.refresh(&state.held_claims)?;
                    state.last_heartbeat = Instant::now();
                }
            }

            if let Some(budget) = self.config.task_timeout {
                let waiting: Vec<NodeIndex> =
                    state.claim_waits.iter().map(|wait| wait.node).collect();
                let mut timed_out = Vec::new();
                for index in state.graph.node_indices() {
                    let task = state.graph.task(index);
                    if task.future.state().is_terminal() {
                        continue;
                    }
                    let suspended = waiting.contains(&index)
                        || (task.has_run && task.pending_result.is_some());
                    if !suspended {
                        continue;
                    }
                    if let Some(started) = task.started {
                        if started.elapsed() > budget {
                            timed_out.push(index);
                        }
                    }
                }
                for index in timed_out {
                    state.claim_waits.retain(|wait| wait.node != index);
                    let label = state.graph.task(index).label.clone();
                    warn!(task = %label, "task exceeded its budget");
                    self.fail_task(
                        &mut state,
                        index,
                        Error::Timeout {
                            label,
                            budget_ms: budget.as_millis() as u64,
                        },
                    )?;
                }
            }
        }

        let due: Vec<ClaimWait> = {
            let mut state = self.state.lock().unwrap();
            let now = Instant::now();
            let mut due = Vec::new();
            let mut rest = Vec::new();
            for wait in state.claim_waits.drain(..) {
                if wait.due <= now {
                    due.push(wait);
                } else {
                    rest.push(wait);
                }
            }
            state.claim_waits = rest;
            due
        };
        for wait in due {
            self.poll_claim(wait)?;
        }
        Ok(())
    }

    /// Re-check a foreign claim: adopt the published result, take over the
    /// claim when released or stale, or back off further.
    fn poll_claim(&self, wait: ClaimWait) -> Result<(), Error> {
        let Some(cache) = self.cache.clone() else {
            return Ok(());
        };
        let mut state = self.state.lock().unwrap();
        if state.graph.task(wait.node).future.state().is_terminal() {
            return Ok(());
        }
        let (hash, rule_id, input_hash) = {
            let task = state.graph.task(wait.node);
            (task.fingerprint, task.rule_id.clone(), task.input_hash)
        };

        match cache.try_claim(&hash, &rule_id, &input_hash)? {
            ClaimOutcome::Published(value) => {
                debug!(task = %state.graph.task(wait.node).label, "foreign result adopted");
                self.adopt_result(&mut state, wait.node, value)
            }
            ClaimOutcome::Claimed => {
                state.held_claims.insert(hash);
                state.graph.task_mut(wait.node).claim_held = true;
                state.graph.requeue(wait.node);
                Ok(())
            }
            ClaimOutcome::Busy { age } => {
                if age > self.config.stale_claim
                    && cache.reclaim_if_stale(&hash, self.config.stale_claim)?
                {
                    state.held_claims.insert(hash);
                    state.graph.task_mut(wait.node).claim_held = true;
                    state.graph.requeue(wait.node);
                    Ok(())
                } else {
                    let delay = (wait.delay * 2).min(self.config.claim_backoff_cap);
                    state.claim_waits.push(ClaimWait {
                        node: wait.node,
                        due: Instant::now() + delay,
                        delay,
                    });
                    Ok(())
                }
            }
        }
    }

    /// Take a ready task through the cache short-circuit and claim protocol,
    /// and extract its body and substituted arguments if it must run.
    pub(crate) fn prepare_ready(&self, index: NodeIndex) -> Result<Prepared, Error> {
        let mut state = self.state.lock().unwrap();
        let (hash, rule_id, input_hash, force, already_claimed) = {
            let task = state.graph.task(index);
            (
                task.fingerprint,
                task.rule_id.clone(),
                task.input_hash,
                task.force_run,
                task.claim_held,
            )
        };

        if let Some(cache) = self.cache.clone() {
            if !already_claimed {
                if !force {
                    if let Some(value) = cache.lookup(&hash, &rule_id, &input_hash)? {
                        debug!(task = %state.graph.task(index).label, "result restored from cache");
                        self.adopt_result(&mut state, index, value)?;
                        return Ok(Prepared::Settled);
                    }
                }
                match cache.try_claim(&hash, &rule_id, &input_hash)? {
                    ClaimOutcome::Claimed => {
                        state.held_claims.insert(hash);
                        state.graph.task_mut(index).claim_held = true;
                    }
                    ClaimOutcome::Published(value) => {
                        if !force {
                            self.adopt_result(&mut state, index, value)?;
                            return Ok(Prepared::Settled);
                        }
                    }
                    ClaimOutcome::Busy { age } => {
                        if age > self.config.stale_claim
                            && cache.reclaim_if_stale(&hash, self.config.stale_claim)?
                        {
                            state.held_claims.insert(hash);
                            state.graph.task_mut(index).claim_held = true;
                        } else if !force {
                            let delay = self.config.claim_backoff;
                            let task = state.graph.task_mut(index);
                            if task.started.is_none() {
                                task.started = Some(Instant::now());
                            }
                            debug!(task = %task.label, "fingerprint claimed elsewhere, polling");
                            state.claim_waits.push(ClaimWait {
                                node: index,
                                due: Instant::now() + delay,
                                delay,
                            });
                            return Ok(Prepared::Settled);
                        }
                    }
                }
            }
        }

        state.graph.mark_running(index);
        state.graph.task_mut(index).started = Some(Instant::now());
        self.emit_task(&mut state, Event::TaskRunStart, index)?;

        let task = state.graph.task(index);
        debug!(task = %task.label, "running body");
        let body = task.body.clone();
        let args_value = task
            .input
            .substitute(&|hash| state.graph.resolve_ref(hash))
            .map_err(Error::from)?;
        let args = match args_value {
            Value::Seq(items) => items,
            other => vec![other],
        };
        Ok(Prepared::Run { body, args })
    }

    /// Process a body's return value: record side-effect result futures as
    /// children and complete once everything they need is resolved.
    pub(crate) fn finish_run(
        &self,
        index: NodeIndex,
        outcome: anyhow::Result<Value>,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.graph.mark_done(index);
        state.graph.task_mut(index).has_run = true;
        self.emit_task(&mut state, Event::TaskRunEnd, index)?;

        let value = match outcome {
            Ok(value) => value,
            Err(err) => {
                let label = state.graph.task(index).label.clone();
                let error = match err.downcast::<Error>() {
                    // A demanded dependency failed and the body passed the
                    // error through rather than catching it.
                    Ok(dep_err) => Error::DependencyFailed {
                        label,
                        dep: dep_label(&dep_err),
                        source: Arc::new(dep_err),
                    },
                    Err(other) => Error::RuleFailure {
                        label,
                        source: Arc::new(other),
                    },
                };
                return self.fail_task(&mut state, index, error);
            }
        };

        let result_refs = value.refs();
        let mut outstanding = false;
        let mut failed_dep = None;
        for hash in &result_refs {
            match state.graph.get(hash) {
                Some(child) => match state.graph.task(child).future.state() {
                    State::Done => {}
                    State::Errored | State::Cancelled => {
                        failed_dep = Some(child);
                        break;
                    }
                    _ => {
                        state.graph.add_dependency(index, child, Dep::Result);
                        outstanding = true;
                    }
                },
                None => {
                    let known = self
                        .cache
                        .as_deref()
                        .map(|cache| cache.lookup_value(hash))
                        .transpose()?
                        .flatten()
                        .is_some();
                    if !known {
                        let error = Error::from(ValueError::UnresolvedRef(*hash));
                        return self.fail_task(&mut state, index, error);
                    }
                }
            }
        }

        if let Some(child) = failed_dep {
            let label = state.graph.task(index).label.clone();
            let dep = state.graph.task(child).label.clone();
            let source = Arc::new(
                state
                    .graph
                    .task(child)
                    .future
                    .error()
                    .cloned()
                    .unwrap_or(Error::Cancelled),
            );
            return self.fail_task(
                &mut state,
                index,
                Error::DependencyFailed { label, dep, source },
            );
        }

        if outstanding {
            let task = state.graph.task_mut(index);
            task.pending_result = Some(value);
            debug!(task = %task.label, "has run, awaiting result futures");
            return Ok(());
        }

        let substituted = match self.resolve_value(&state, &value) {
            Ok(substituted) => substituted,
            Err(err) => return self.fail_task(&mut state, index, err),
        };
        self.complete(&mut state, index, substituted, &result_refs)
    }

    /// Substitute every embedded reference from the graph, falling back to
    /// the persistent cache for fingerprints this session never created.
    fn resolve_value(&self, state: &SessionState, value: &Value) -> Result<Value, Error> {
        if !value.contains_refs() {
            return Ok(value.clone());
        }
        let cache = self.cache.as_deref();
        value
            .substitute(&|hash| {
                state.graph.resolve_ref(hash).or_else(|| {
                    cache.and_then(|cache| cache.lookup_value(hash).ok().flatten())
                })
            })
            .map_err(Error::from)
    }

    /// Finish a task whose result came out of the persistent cache; the
    /// body is skipped and descent into the dependency tree stops here.
    fn adopt_result(
        &self,
        state: &mut SessionState,
        index: NodeIndex,
        value: Value,
    ) -> Result<(), Error> {
        state.graph.task_mut(index).has_run = true;
        let result_refs = value.refs();
        match self.resolve_value(state, &value) {
            Ok(substituted) => self.complete(state, index, substituted, &result_refs),
            Err(err) => self.fail_task(state, index, err),
        }
    }

    /// If a task that has run still waits on result futures, complete it
    /// once the counter drains.
    fn try_complete(&self, state: &mut SessionState, index: NodeIndex) -> Result<(), Error> {
        let pending = {
            let task = state.graph.task(index);
            if task.future.state().is_terminal()
                || !task.has_run
                || task.future.unresolved() > 0
            {
                return Ok(());
            }
            match &task.pending_result {
                Some(value) => value.clone(),
                None => return Ok(()),
            }
        };
        let result_refs = pending.refs();
        match self.resolve_value(state, &pending) {
            Ok(substituted) => self.complete(state, index, substituted, &result_refs),
            Err(err) => self.fail_task(state, index, err),
        }
    }

    /// Store the final substituted result: publish to the cache (releasing
    /// the claim in the same transaction), settle the future, and notify
    /// parents.
    fn complete(
        &self,
        state: &mut SessionState,
        index: NodeIndex,
        value: Value,
        result_refs: &[Hash],
    ) -> Result<(), Error> {
        let publish = {
            let task = state.graph.task(index);
            task.claim_held.then(|| {
                (
                    task.fingerprint,
                    task.rule_id.clone(),
                    task.input_hash,
                    task.input.refs(),
                    task.side_tasks.clone(),
                )
            })
        };
        if let Some((hash, rule_id, input_hash, mut children, side_tasks)) = publish {
            if let Some(cache) = &self.cache {
                // Children cover the full relationship: input futures, result
                // futures and every side task, including side-effect-only
                // tasks whose output the result never embeds.
                for child in result_refs.iter().chain(side_tasks.iter()) {
                    if !children.contains(child) {
                        children.push(*child);
                    }
                }
                cache.publish(&hash, &rule_id, &input_hash, &value, &children)?;
                state.held_claims.remove(&hash);
                state.graph.task_mut(index).claim_held = false;
            }
        }

        let notified = {
            let task = state.graph.task_mut(index);
            task.pending_result = None;
            task.future.set_result(value).unwrap_or(0)
        };
        state.parked = state.parked.saturating_sub(notified);
        state.graph.mark_done(index);
        debug!(task = %state.graph.task(index).label, "task done");
        self.emit_task(state, Event::TaskDone, index)?;

        for parent in state.graph.parents(index) {
            if state.graph.task(parent).future.state().is_terminal() {
                continue;
            }
            if !state.graph.task_mut(parent).future.child_done() {
                continue;
            }
            if state.graph.task(parent).has_run {
                self.try_complete(state, parent)?;
            } else if state.graph.settle(parent) {
                self.emit_task(state, Event::TaskReady, parent)?;
            }
        }
        Ok(())
    }

    /// Settle a task as Errored and propagate dependency failure along the
    /// parent edges. Cache writes are skipped; held claims are released.
    pub(crate) fn fail_task(
        &self,
        state: &mut SessionState,
        index: NodeIndex,
        error: Error,
    ) -> Result<(), Error> {
        let mut queue = vec![(index, error)];
        while let Some((node, error)) = queue.pop() {
            if state.graph.task(node).future.state().is_terminal() {
                continue;
            }
            let (notified, claim) = {
                let task = state.graph.task_mut(node);
                let notified = task.future.set_error(error.clone()).unwrap_or(0);
                let claim = task.claim_held.then_some(task.fingerprint);
                task.claim_held = false;
                (notified, claim)
            };
            state.parked = state.parked.saturating_sub(notified);
            state.graph.mark_done(node);
            state.claim_waits.retain(|wait| wait.node != node);
            if let Some(hash) = claim {
                if let Some(cache) = &self.cache {
                    cache.release(&hash)?;
                }
                state.held_claims.remove(&hash);
            }
            warn!(task = %state.graph.task(node).label, %error, "task failed");
            self.emit_task(state, Event::TaskError, node)?;

            let dep = state.graph.task(node).label.clone();
            for parent in state.graph.parents(node) {
                if state.graph.task(parent).future.state().is_terminal() {
                    continue;
                }
                queue.push((
                    parent,
                    Error::DependencyFailed {
                        label: state.graph.task(parent).label.clone(),
                        dep: dep.clone(),
                        source: Arc::new(error.clone()),
                    },
                ));
            }
        }
        Ok(())
    }
}

fn dep_label(error: &Error) -> String {
    match error {
        Error::RuleFailure { label, .. }
        | Error::DependencyFailed { label, .. }
        | Error::Timeout { label, .. } => label.clone(),
        other => other.to_string(),
    }
}

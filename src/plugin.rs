//! Session plugins.
//!
//! Plugins observe the fixed set of session events and may act on tasks only
//! through [`TaskView`] — attach metadata, or force a body to run when a
//! cached result would otherwise be adopted. Handlers run synchronously in
//! registration order; a handler returning an error aborts the session.

use std::fmt;

use crate::future::State;
use crate::hash::Hash;
use crate::task::Task;
use crate::value::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    SessionOpen,
    PostEnter,
    PreExit,
    SessionClose,
    TaskCreated,
    TaskReady,
    TaskRunStart,
    TaskRunEnd,
    TaskDone,
    TaskError,
}

impl Event {
    pub fn all() -> &'static [Event] {
        &[
            Event::SessionOpen,
            Event::PostEnter,
            Event::PreExit,
            Event::SessionClose,
            Event::TaskCreated,
            Event::TaskReady,
            Event::TaskRunStart,
            Event::TaskRunEnd,
            Event::TaskDone,
            Event::TaskError,
        ]
    }

    pub fn name(self) -> &'static str {
        match self {
            Event::SessionOpen => "session-open",
            Event::PostEnter => "post-enter",
            Event::PreExit => "pre-exit",
            Event::SessionClose => "session-close",
            Event::TaskCreated => "task-created",
            Event::TaskReady => "task-ready",
            Event::TaskRunStart => "task-run-start",
            Event::TaskRunEnd => "task-run-end",
            Event::TaskDone => "task-done",
            Event::TaskError => "task-error",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The slice of a task a plugin is allowed to see and touch.
pub struct TaskView<'a> {
    pub(crate) task: &'a mut Task,
}

impl TaskView<'_> {
    pub fn fingerprint(&self) -> Hash {
        self.task.fingerprint
    }

    pub fn rule(&self) -> &str {
        &self.task.rule_id
    }

    pub fn label(&self) -> &str {
        &self.task.label
    }

    pub fn state(&self) -> State {
        self.task.future.state()
    }

    /// The result value, present once the task is done.
    pub fn result(&self) -> Option<&Value> {
        self.task.future.result()
    }

    pub fn error(&self) -> Option<&crate::error::Error> {
        self.task.future.error()
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.task.meta.get(key).map(String::as_str)
    }

    pub fn set_meta(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.task.meta.insert(key.into(), value.into());
    }

    /// Override the result source: run the body even when the persistent
    /// cache already holds a result for this fingerprint. Useful for
    /// observability descent into otherwise short-circuited trees.
    pub fn force_run(&mut self) {
        self.task.force_run = true;
    }
}

/// An event subscriber installed on a session for its lifetime.
///
/// Every handler defaults to a no-op; implement the ones for the events the
/// plugin subscribes to. Handlers run synchronously under the session's
/// scheduling lock and must not call back into the session.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// Which events this plugin wants; handlers for other events are never
    /// invoked.
    fn subscriptions(&self) -> &'static [Event] {
        Event::all()
    }

    fn on_session_open(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_post_enter(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_pre_exit(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_session_close(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_task_created(&self, _task: &mut TaskView<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_task_ready(&self, _task: &mut TaskView<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_task_run_start(&self, _task: &mut TaskView<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_task_run_end(&self, _task: &mut TaskView<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_task_done(&self, _task: &mut TaskView<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_task_error(&self, _task: &mut TaskView<'_>) -> anyhow::Result<()> {
        Ok(())
    }
}

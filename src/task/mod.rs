//! Runner-bound task composition.
//!
//! A [`Task`] wraps a user callable bound to a runner; composition nodes
//! ([`sequence`], [`repeat`]) thread a state value through the chain,
//! scheduling every step on the runner the step was created for. Nothing
//! here blocks: running a task posts its first step and returns.

use crate::runner::AsRunner;

use std::sync::{Arc, Weak};

/// Continuation receiving a step's output.
type Step<T> = Box<dyn FnOnce(T) + Send + 'static>;

/// A task's driver: consumes the input state and a continuation.
type RunFn<I, O> = dyn Fn(I, Step<O>) + Send + Sync + 'static;

/// A composable unit of work producing `O` from `I` on some runner.
///
/// Tasks are cheap handles and can be cloned into several compositions.
/// If a task's runner is gone by the time the chain reaches it, the chain
/// ends there; pending continuations are dropped.
pub struct Task<I, O> {
    run: Arc<RunFn<I, O>>,
}

impl<I, O> Clone for Task<I, O> {
    fn clone(&self) -> Self {
        Task {
            run: self.run.clone(),
        }
    }
}

impl<I, O> Task<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Posts execution with `initial` and returns immediately.
    ///
    /// The final output is discarded; compose with [`sequence`] to act
    /// on it.
    pub fn run(&self, initial: I) {
        (self.run)(initial, Box::new(|_output| {}));
    }

    /// Chains `next` after this task, forwarding the output state.
    pub fn then<O2>(self, next: Task<O, O2>) -> Task<I, O2>
    where
        O2: Send + 'static,
    {
        let first = self.run;
        let second = next.run;

        Task {
            run: Arc::new(move |input, done: Step<O2>| {
                let second = second.clone();
                first(input, Box::new(move |mid| second(mid, done)));
            }),
        }
    }
}

/// Lifts a callable into a task bound to `runner`.
///
/// The callable receives the runner it executes on, so state carried by a
/// user-defined runner type is in reach, plus the threaded input.
pub fn create<R, I, O, F>(runner: &Arc<R>, f: F) -> Task<I, O>
where
    R: AsRunner,
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(&Arc<R>, I) -> O + Send + Sync + 'static,
{
    let runner: Weak<R> = Arc::downgrade(runner);
    let f = Arc::new(f);

    Task {
        run: Arc::new(move |input, next: Step<O>| {
            let Some(target) = runner.upgrade() else {
                return;
            };
            let f = f.clone();
            let receiver = target.clone();
            target.as_runner().schedule(move || {
                let output = f(&receiver, input);
                next(output);
            });
        }),
    }
}

/// Runs `first` and then `second`, forwarding the output state.
pub fn sequence<I, M, O>(first: Task<I, M>, second: Task<M, O>) -> Task<I, O>
where
    I: Send + 'static,
    M: Send + 'static,
    O: Send + 'static,
{
    first.then(second)
}

/// Composes a predicate and an optional body into a loop task.
///
/// Per iteration the predicate runs on its own runner with the current
/// state; on `false` the state is yielded to the continuation. Otherwise
/// the body (when present) produces the next state on its runner, or the
/// predicate is simply re-evaluated with the state unchanged.
pub fn repeat<I>(predicate: Task<I, bool>, body: Option<Task<I, I>>) -> Task<I, I>
where
    I: Clone + Send + 'static,
{
    Task {
        run: Arc::new(move |input, done| {
            step(predicate.run.clone(), body.clone().map(|b| b.run), input, done);
        }),
    }
}

fn step<I>(predicate: Arc<RunFn<I, bool>>, body: Option<Arc<RunFn<I, I>>>, state: I, done: Step<I>)
where
    I: Clone + Send + 'static,
{
    let carried = state.clone();
    let pred = predicate.clone();

    predicate(
        state,
        Box::new(move |keep| {
            if !keep {
                done(carried);
                return;
            }

            match body {
                Some(run_body) => {
                    let next_pred = pred;
                    let next_body = Some(run_body.clone());
                    run_body(
                        carried,
                        Box::new(move |state| step(next_pred, next_body, state, done)),
                    );
                }
                None => step(pred, None, carried, done),
            }
        }),
    );
}

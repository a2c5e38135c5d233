//! Retry sessions: a presentation surface bound to one re-runnable snippet.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Arc,
};

use tracing::{info, warn};

use crate::{
    config::Config,
    execution::{Coordinator, ExecutionContext, ExecutionOutcome},
    origin::{ResolveError, Resolver, Snippet, SnippetOrigin},
};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Principal(String);

impl Principal {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceId(String);

impl SurfaceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SurfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Principals allowed to trigger a retry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Authorization {
    principals: HashSet<Principal>,
}

impl Authorization {
    pub fn single(principal: Principal) -> Self {
        Self { principals: HashSet::from([principal]) }
    }

    pub fn from_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { principals: ids.into_iter().map(Principal::new).collect() }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::from_ids(cfg.get_list("DEV_USER_IDS"))
    }

    pub fn permits(&self, principal: &Principal) -> bool {
        self.principals.contains(principal)
    }
}

/// Renders outcomes onto a surface. Denials are private to the principal
/// who asked.
pub trait Presenter {
    fn render(&mut self, surface: &SurfaceId, snippet: &Snippet, outcome: &ExecutionOutcome);
    fn deny(&mut self, surface: &SurfaceId, principal: &Principal);
    fn resolution_failed(&mut self, surface: &SurfaceId, error: &ResolveError);
}

/// Builds the context for attempt `n` (1-based).
pub type ContextFactory = Arc<dyn Fn(u32) -> ExecutionContext + Send + Sync>;

/// The logical action behind a retry control: resolve, then run.
#[derive(Clone)]
pub struct Runner {
    origin: SnippetOrigin,
    resolver: Resolver,
    coordinator: Coordinator,
    contexts: ContextFactory,
}

impl Runner {
    pub fn new(origin: SnippetOrigin, resolver: Resolver, coordinator: Coordinator) -> Self {
        Self { origin, resolver, coordinator, contexts: Arc::new(|_| ExecutionContext::new()) }
    }

    pub fn with_contexts<F>(mut self, contexts: F) -> Self
    where
        F: Fn(u32) -> ExecutionContext + Send + Sync + 'static,
    {
        self.contexts = Arc::new(contexts);
        self
    }

    pub fn origin(&self) -> &SnippetOrigin {
        &self.origin
    }

    pub async fn attempt(&self, number: u32) -> Result<Attempt, ResolveError> {
        let snippet = self.resolver.resolve(&self.origin).await?;
        let context = (self.contexts)(number);
        let outcome = self.coordinator.run(&snippet, context).await;
        Ok(Attempt { number, snippet, outcome })
    }
}

impl fmt::Debug for Runner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runner")
            .field("origin", &self.origin)
            .field("coordinator", &self.coordinator)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct Attempt {
    pub number: u32,
    pub snippet: Snippet,
    pub outcome: ExecutionOutcome,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetryResponse {
    Denied,
    Rerun(ExecutionOutcome),
    /// Nothing ran; the displayed outcome is unchanged.
    ResolutionFailed(ResolveError),
}

pub struct RetrySession<P> {
    surface: SurfaceId,
    authorization: Authorization,
    runner: Runner,
    presenter: P,
    latest: Attempt,
}

impl<P: Presenter> RetrySession<P> {
    /// Runs and renders the first attempt. A session exists only once
    /// that attempt produced an outcome.
    pub async fn start(
        surface: SurfaceId,
        authorization: Authorization,
        runner: Runner,
        mut presenter: P,
    ) -> Result<Self, ResolveError> {
        match runner.attempt(1).await {
            Ok(attempt) => {
                presenter.render(&surface, &attempt.snippet, &attempt.outcome);
                Ok(Self { surface, authorization, runner, presenter, latest: attempt })
            }
            Err(e) => {
                presenter.resolution_failed(&surface, &e);
                Err(e)
            }
        }
    }

    pub async fn trigger(&mut self, principal: &Principal) -> RetryResponse {
        if !self.authorization.permits(principal) {
            warn!(surface = %self.surface, %principal, "retry denied");
            self.presenter.deny(&self.surface, principal);
            return RetryResponse::Denied;
        }

        let number = self.latest.number + 1;
        info!(surface = %self.surface, %principal, attempt = number, "retrying snippet");
        match self.runner.attempt(number).await {
            Ok(attempt) => {
                self.presenter.render(&self.surface, &attempt.snippet, &attempt.outcome);
                let outcome = attempt.outcome.clone();
                self.latest = attempt;
                RetryResponse::Rerun(outcome)
            }
            Err(e) => {
                self.presenter.resolution_failed(&self.surface, &e);
                RetryResponse::ResolutionFailed(e)
            }
        }
    }

    pub fn surface(&self) -> &SurfaceId {
        &self.surface
    }

    pub fn latest(&self) -> &Attempt {
        &self.latest
    }

    pub fn presenter(&self) -> &P {
        &self.presenter
    }

    pub fn into_presenter(self) -> P {
        self.presenter
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("surface {0} already has a retry session")]
    AlreadyBound(SurfaceId),
    #[error("no retry session for surface {0}")]
    UnknownSurface(SurfaceId),
}

/// At most one session per surface.
pub struct SessionRegistry<P> {
    sessions: HashMap<SurfaceId, RetrySession<P>>,
}

impl<P> Default for SessionRegistry<P> {
    fn default() -> Self {
        Self { sessions: HashMap::new() }
    }
}

impl<P: Presenter> SessionRegistry<P> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, session: RetrySession<P>) -> Result<(), SessionError> {
        let surface = session.surface().clone();
        if self.sessions.contains_key(&surface) {
            return Err(SessionError::AlreadyBound(surface));
        }
        self.sessions.insert(surface, session);
        Ok(())
    }

    pub async fn trigger(
        &mut self,
        surface: &SurfaceId,
        principal: &Principal,
    ) -> Result<RetryResponse, SessionError> {
        let session = self
            .sessions
            .get_mut(surface)
            .ok_or_else(|| SessionError::UnknownSurface(surface.clone()))?;
        Ok(session.trigger(principal).await)
    }

    /// Drops the binding once the surface stops being interactive.
    pub fn detach(&mut self, surface: &SurfaceId) -> Option<RetrySession<P>> {
        self.sessions.remove(surface)
    }

    pub fn get(&self, surface: &SurfaceId) -> Option<&RetrySession<P>> {
        self.sessions.get(surface)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

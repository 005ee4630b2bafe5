//! Composition and wiring of pipelines.

use crate::cancellation::CancellationToken;
use crate::context::{Context, ExecutionRequest};
use crate::errors::PipelineError;
use crate::pipeline::result::{self, ResultSink};
use crate::pipeline::{Pipeline, PipelineOptions};
use crate::services::ServiceRegistry;
use crate::stages::{
    invoke_continuation, BranchStage, BufferedStage, Continuation, Filter, FilterStage, FnFilter,
    FnProcess, ForkStage, PassThroughStage, Process, Stage,
};
use futures::FutureExt;
use std::future::Future;
use std::sync::Arc;

enum StageSpec {
    Step { label: String, hook: Arc<dyn Process> },
    Filter { label: String, hook: Arc<dyn Filter> },
    Buffered { label: String, hook: Arc<dyn Process> },
    Branch { label: String, hook: Arc<dyn Filter>, child: PipelineBuilder },
    Fork { label: String, hook: Arc<dyn Filter>, child: PipelineBuilder },
}

impl StageSpec {
    fn label(&self) -> &str {
        match self {
            Self::Step { label, .. }
            | Self::Filter { label, .. }
            | Self::Buffered { label, .. }
            | Self::Branch { label, .. }
            | Self::Fork { label, .. } => label,
        }
    }
}

struct SourceSpec {
    label: String,
    hook: Arc<dyn Process>,
}

fn short_type_name<T>() -> String {
    std::any::type_name::<T>()
        .rsplit("::")
        .next()
        .unwrap_or("Unknown")
        .to_string()
}

/// Composes a [`Pipeline`] from an ordered list of stage registrations.
///
/// Stages are declared head-to-tail; `build()` performs the linking
/// pass tail-to-head, assigning each stage its name, its cancellation
/// token, and its `next` continuation, then freezes the chain. Branch
/// and Fork registrations carry their own child builder, which the
/// owning stage builds into a sub-pipeline on start.
///
/// Naming: stages are keyed `"Step {n}. {type}"` where `n` counts from
/// 1 at the *last* declared stage and increases toward the first. The
/// numbering is deliberately preserved from the system this engine is
/// compatible with; error-ledger keys depend on it.
pub struct PipelineBuilder {
    options: PipelineOptions,
    options_set: bool,
    services: ServiceRegistry,
    global: Option<Arc<Context>>,
    sources: Vec<SourceSpec>,
    stages: Vec<StageSpec>,
}

impl PipelineBuilder {
    /// Creates an empty builder with default options.
    #[must_use]
    pub fn new() -> Self {
        Self {
            options: PipelineOptions::default(),
            options_set: false,
            services: ServiceRegistry::new(),
            global: None,
            sources: Vec::new(),
            stages: Vec::new(),
        }
    }

    /// Sets the options shared by every buffered stage and polling loop
    /// of the built pipeline. Child builders that were not explicitly
    /// configured inherit the parent's options.
    #[must_use]
    pub fn with_options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self.options_set = true;
        self
    }

    /// Supplies the run's global context instead of a fresh one.
    #[must_use]
    pub fn with_global_context(mut self, global: Arc<Context>) -> Self {
        self.global = Some(global);
        self
    }

    /// Registers a shared value resolvable from every request's scope.
    #[must_use]
    pub fn register_service<T: Send + Sync + 'static>(self, value: T) -> Self {
        self.services.register(value);
        self
    }

    /// Appends a pass-through stage backed by a [`Process`] type.
    #[must_use]
    pub fn add_step<P: Process + 'static>(mut self, step: P) -> Self {
        self.stages.push(StageSpec::Step {
            label: short_type_name::<P>(),
            hook: Arc::new(step),
        });
        self
    }

    /// Appends a filter stage backed by a [`Filter`] type.
    #[must_use]
    pub fn add_filter<F: Filter + 'static>(mut self, filter: F) -> Self {
        self.stages.push(StageSpec::Filter {
            label: short_type_name::<F>(),
            hook: Arc::new(filter),
        });
        self
    }

    /// Appends a buffered stage backed by a [`Process`] type.
    #[must_use]
    pub fn add_buffered_step<P: Process + 'static>(mut self, step: P) -> Self {
        self.stages.push(StageSpec::Buffered {
            label: short_type_name::<P>(),
            hook: Arc::new(step),
        });
        self
    }

    /// Registers a source: a buffered stage positioned as a chain entry
    /// point. Submitted items enter through the first registered source.
    #[must_use]
    pub fn add_source<P: Process + 'static>(mut self, source: P) -> Self {
        self.sources.push(SourceSpec {
            label: short_type_name::<P>(),
            hook: Arc::new(source),
        });
        self
    }

    /// Appends a branch stage: requests matching `filter` detour
    /// through the chain described by `child` and then rejoin.
    #[must_use]
    pub fn add_branch<F: Filter + 'static>(mut self, filter: F, child: Self) -> Self {
        self.stages.push(StageSpec::Branch {
            label: short_type_name::<F>(),
            hook: Arc::new(filter),
            child,
        });
        self
    }

    /// Appends a fork stage: requests matching `filter` leave the
    /// parent chain for good and finish through `child`.
    #[must_use]
    pub fn add_fork<F: Filter + 'static>(mut self, filter: F, child: Self) -> Self {
        self.stages.push(StageSpec::Fork {
            label: short_type_name::<F>(),
            hook: Arc::new(filter),
            child,
        });
        self
    }

    /// Appends a pass-through stage from an async closure.
    #[must_use]
    pub fn add_inline_step<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<ExecutionRequest>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.stages.push(StageSpec::Step {
            label: "InlineStep".to_string(),
            hook: Arc::new(FnProcess::new(f)),
        });
        self
    }

    /// Appends a filter stage from an async closure.
    #[must_use]
    pub fn add_inline_filter<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<ExecutionRequest>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        self.stages.push(StageSpec::Filter {
            label: "InlineFilter".to_string(),
            hook: Arc::new(FnFilter::new(f)),
        });
        self
    }

    /// Appends a buffered stage from an async closure.
    #[must_use]
    pub fn add_inline_buffered_step<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<ExecutionRequest>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.stages.push(StageSpec::Buffered {
            label: "InlineBufferedStep".to_string(),
            hook: Arc::new(FnProcess::new(f)),
        });
        self
    }

    /// Registers a source from an async closure.
    #[must_use]
    pub fn add_inline_source<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<ExecutionRequest>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.sources.push(SourceSpec {
            label: "InlineSource".to_string(),
            hook: Arc::new(FnProcess::new(f)),
        });
        self
    }

    /// Appends a branch stage from an async predicate closure.
    #[must_use]
    pub fn add_inline_branch<F, Fut>(mut self, f: F, child: Self) -> Self
    where
        F: Fn(Arc<ExecutionRequest>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        self.stages.push(StageSpec::Branch {
            label: "InlineBranch".to_string(),
            hook: Arc::new(FnFilter::new(f)),
            child,
        });
        self
    }

    /// Appends a fork stage from an async predicate closure.
    #[must_use]
    pub fn add_inline_fork<F, Fut>(mut self, f: F, child: Self) -> Self
    where
        F: Fn(Arc<ExecutionRequest>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        self.stages.push(StageSpec::Fork {
            label: "InlineFork".to_string(),
            hook: Arc::new(FnFilter::new(f)),
            child,
        });
        self
    }

    /// Number of registered stages (sources not included).
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    fn is_empty(&self) -> bool {
        self.stages.is_empty() && self.sources.is_empty()
    }

    fn validate(&self) -> Result<(), PipelineError> {
        if self.is_empty() {
            return Err(PipelineError::Empty);
        }
        for spec in &self.stages {
            if let StageSpec::Branch { child, .. } | StageSpec::Fork { child, .. } = spec {
                child.validate()?;
            }
        }
        Ok(())
    }

    /// Builds the pipeline: constructs every stage, then links the
    /// chain tail-to-head and freezes it.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Empty`] if this builder (or any nested
    /// child builder) has no sources and no stages.
    pub fn build(self) -> Result<Pipeline, PipelineError> {
        self.build_with(None, None, None)
    }

    /// As [`PipelineBuilder::build`], but with a parent cancellation
    /// token to derive from, an override for the terminal continuation
    /// (used by Branch/Fork to splice sub-chains), and an optional
    /// pre-existing global context.
    pub(crate) fn build_with(
        mut self,
        parent_token: Option<CancellationToken>,
        output: Option<Continuation>,
        global: Option<Arc<Context>>,
    ) -> Result<Pipeline, PipelineError> {
        self.validate()?;

        let token = parent_token.map_or_else(CancellationToken::new, |parent| parent.child());
        let global = global
            .or(self.global.take())
            .unwrap_or_else(|| Arc::new(Context::new()));

        let (sink, results) = result::channel(token.clone(), self.options.poll_interval());
        let sink_continuation = terminal_continuation(&sink);
        let terminal = output.unwrap_or_else(|| sink_continuation.clone());

        let mut stages: Vec<Arc<dyn Stage>> = Vec::with_capacity(self.stages.len());
        let mut labels: Vec<String> = Vec::with_capacity(self.stages.len());
        for spec in self.stages {
            labels.push(spec.label().to_string());
            stages.push(instantiate(spec, &self.options));
        }

        // Linking pass: tail-to-head, so each stage can point at the
        // already-linked stage behind it. Position numbers are assigned
        // in the same direction.
        let mut previous: Option<Arc<dyn Stage>> = None;
        let mut position = 1;
        for (stage, label) in stages.iter().zip(&labels).rev() {
            stage.core().set_name(format!("Step {position}. {label}"));
            position += 1;
            stage.core().set_token(token.clone());
            stage.core().set_end(sink_continuation.clone());
            let next = previous
                .take()
                .map_or_else(|| terminal.clone(), invoke_continuation);
            stage.core().set_next(next);
            previous = Some(stage.clone());
        }

        let head = previous.map_or_else(|| terminal.clone(), invoke_continuation);
        let mut sources: Vec<Arc<dyn Stage>> = Vec::with_capacity(self.sources.len());
        for spec in self.sources {
            let source: Arc<dyn Stage> =
                Arc::new(BufferedStage::new(spec.hook, self.options.clone()));
            source.core().set_name(spec.label);
            source.core().set_token(token.clone());
            source.core().set_end(sink_continuation.clone());
            source.core().set_next(head.clone());
            sources.push(source);
        }

        Ok(Pipeline::new(
            global,
            sources,
            stages,
            self.services,
            self.options,
            token,
            sink,
            results,
        ))
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PipelineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineBuilder")
            .field("sources", &self.sources.len())
            .field("stages", &self.stages.len())
            .finish()
    }
}

/// The sink every chain ultimately drains into: marks the request
/// complete and pushes its item context to the result stream.
fn terminal_continuation(sink: &ResultSink) -> Continuation {
    let sink = sink.clone();
    Arc::new(move |request| {
        let sink = sink.clone();
        async move {
            request.complete();
            sink.push(request.item().clone());
        }
        .boxed()
    })
}

fn instantiate(spec: StageSpec, options: &PipelineOptions) -> Arc<dyn Stage> {
    match spec {
        StageSpec::Step { hook, .. } => Arc::new(PassThroughStage::new(hook)),
        StageSpec::Filter { hook, .. } => Arc::new(FilterStage::new(hook)),
        StageSpec::Buffered { hook, .. } => Arc::new(BufferedStage::new(hook, options.clone())),
        StageSpec::Branch { hook, mut child, .. } => {
            if !child.options_set {
                child.options = options.clone();
            }
            Arc::new(BranchStage::new(hook, child))
        }
        StageSpec::Fork { hook, mut child, .. } => {
            if !child.options_set {
                child.options = options.clone();
            }
            Arc::new(ForkStage::new(hook, child))
        }
    }
}

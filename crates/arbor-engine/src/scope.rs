//! What components see while they render and measure.

use std::any::Any;
use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;

use arbor_core::{
    ComponentKey, EngineError, ResultCache, Result, Stage, StateHandler, StateKey, StateStore,
};
use arbor_layout::{Size, SizeSpecs};
use log::trace;

use crate::component::{Element, ElementId, EventHandler, Render};
use crate::engine::EventContext;
use crate::props::TreeProps;

/// A state slot read during a render or a measurement, at the revision seen.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateRead {
    pub key: StateKey,
    pub revision: u64,
}

/// A leaf measurement kept in a [`ResultCache`].
#[derive(Clone, Debug)]
pub struct CachedMeasure {
    pub element_id: ElementId,
    pub specs: SizeSpecs,
    pub size: Size,
    pub reads: Vec<StateRead>,
}

pub type MeasureCache = ResultCache<CachedMeasure>;

fn initializer_failure(key: &StateKey, error: impl fmt::Display) -> EngineError {
    EngineError::InitializerFailure {
        key: key.to_string(),
        message: error.to_string(),
    }
}

/// Handed to [`crate::Component::render`].
///
/// State hooks are identified by call order, so a component must call
/// `use_state` the same number of times in the same order on every render.
pub struct RenderScope<'a> {
    key: &'a ComponentKey,
    state: &'a mut StateHandler,
    store: &'a StateStore,
    cache: &'a mut MeasureCache,
    props: &'a TreeProps,
    reads: Vec<StateRead>,
    handlers: Vec<(String, EventHandler)>,
    next_slot: u32,
}

impl<'a> RenderScope<'a> {
    pub(crate) fn new(
        key: &'a ComponentKey,
        state: &'a mut StateHandler,
        store: &'a StateStore,
        cache: &'a mut MeasureCache,
        props: &'a TreeProps,
    ) -> Self {
        Self {
            key,
            state,
            store,
            cache,
            props,
            reads: Vec::new(),
            handlers: Vec::new(),
            next_slot: 0,
        }
    }

    pub fn key(&self) -> &ComponentKey {
        self.key
    }

    /// Key of the next state slot `use_state` would claim.
    pub fn next_state_key(&self) -> StateKey {
        self.key.state(self.next_slot)
    }

    pub fn use_state<T>(&mut self, init: impl FnOnce() -> T) -> Result<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        self.try_use_state(|| Ok::<T, Infallible>(init()))
    }

    /// Like [`RenderScope::use_state`] for initializers that can fail. The
    /// failure is shared by every computation racing on the same slot.
    pub fn try_use_state<T, E>(&mut self, init: impl FnOnce() -> std::result::Result<T, E>) -> Result<Arc<T>>
    where
        T: Send + Sync + 'static,
        E: fmt::Display,
    {
        let key = self.key.state(self.next_slot);
        self.next_slot += 1;
        let (value, revision) = self
            .state
            .get_or_init(&key, || init().map_err(|error| initializer_failure(&key, error)))?;
        self.reads.push(StateRead { key, revision });
        Ok(value)
    }

    pub fn tree_prop<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.props.get::<T>()
    }

    pub fn on_event(
        &mut self,
        name: impl Into<String>,
        handler: impl Fn(&EventContext) -> Result<()> + Send + Sync + 'static,
    ) {
        self.handlers.push((name.into(), Arc::new(handler)));
    }

    /// Measures a keyed leaf child ahead of layout.
    ///
    /// The result is cached under the child's component key; when the child
    /// is resolved into a node the layout stage finds it there and skips
    /// the measure function if the specs are compatible.
    pub fn measure(&mut self, element: &Element, specs: SizeSpecs) -> Result<Size> {
        let Some(segment) = element.key() else {
            return Err(EngineError::component(
                self.key,
                format!("measured child `{}` needs an explicit key", element.type_name()),
            ));
        };
        let child_key = self.key.child(segment);
        if let Some(cached) = self.cache.get_for_component(&child_key) {
            if cached.element_id == element.id() && cached.specs.is_compatible(&specs, cached.size) {
                trace!("measure cache hit for {child_key}");
                return Ok(cached.size);
            }
        }

        let render = {
            let mut scope =
                RenderScope::new(&child_key, self.state, self.store, self.cache, self.props);
            element.component().render(&mut scope)?
        };
        let Render::Leaf(measure) = render else {
            return Err(EngineError::component(
                &child_key,
                "only leaves can be measured while resolving",
            ));
        };

        // Initial layout state created here lives only as long as this handler.
        let mut layout_state = self.store.create_handler(Stage::Layout);
        let mut scope = MeasureScope::new(&child_key, &mut layout_state);
        let size = specs.resolve(measure.measure(&mut scope, specs)?);
        let reads = scope.into_reads();
        drop(layout_state);
        self.cache.put_for_component(
            child_key,
            CachedMeasure {
                element_id: element.id(),
                specs,
                size,
                reads,
            },
        )?;
        Ok(size)
    }

    pub(crate) fn finish(self) -> (Vec<StateRead>, Vec<(String, EventHandler)>) {
        (self.reads, self.handlers)
    }
}

/// Handed to a [`crate::MeasureFunction`]. State here belongs to the layout
/// stage and is independent of render state.
pub struct MeasureScope<'a> {
    key: &'a ComponentKey,
    state: &'a mut StateHandler,
    reads: Vec<StateRead>,
    next_slot: u32,
}

impl<'a> MeasureScope<'a> {
    pub(crate) fn new(key: &'a ComponentKey, state: &'a mut StateHandler) -> Self {
        Self {
            key,
            state,
            reads: Vec::new(),
            next_slot: 0,
        }
    }

    pub fn key(&self) -> &ComponentKey {
        self.key
    }

    pub fn use_state<T>(&mut self, init: impl FnOnce() -> T) -> Result<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        let key = self.key.state(self.next_slot);
        self.next_slot += 1;
        let (value, revision) = self.state.get_or_init(&key, || Ok(init()))?;
        self.reads.push(StateRead { key, revision });
        Ok(value)
    }

    pub(crate) fn into_reads(self) -> Vec<StateRead> {
        self.reads
    }
}

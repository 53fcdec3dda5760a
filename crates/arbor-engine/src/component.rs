//! Declarative building blocks: components, the elements that instantiate
//! them, and what a component renders into.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arbor_core::Result;
use arbor_layout::{MeasurePolicy, Size, SizeSpecs};

use crate::engine::EventContext;
use crate::scope::{MeasureScope, RenderScope};

static NEXT_ELEMENT_ID: AtomicU64 = AtomicU64::new(1);

/// A piece of UI described as a function of its props and state.
///
/// `render` may run more than once for the same inputs (retries, cache
/// misses, interrupted passes) and must return equivalent output each time.
pub trait Component: Send + Sync + 'static {
    fn type_name(&self) -> &'static str {
        let full = std::any::type_name::<Self>();
        full.rsplit("::").next().unwrap_or(full)
    }

    fn render(&self, scope: &mut RenderScope<'_>) -> Result<Render>;
}

/// Measures a leaf. Called during layout, never concurrently for one node.
pub trait MeasureFunction: Send + Sync {
    fn measure(&self, scope: &mut MeasureScope<'_>, specs: SizeSpecs) -> Result<Size>;
}

impl<F> MeasureFunction for F
where
    F: Fn(&mut MeasureScope<'_>, SizeSpecs) -> Result<Size> + Send + Sync,
{
    fn measure(&self, scope: &mut MeasureScope<'_>, specs: SizeSpecs) -> Result<Size> {
        self(scope, specs)
    }
}

pub type EventHandler = Arc<dyn Fn(&EventContext) -> Result<()> + Send + Sync>;

/// Output of [`Component::render`].
#[derive(Clone)]
pub enum Render {
    /// A container laid out by `policy`.
    Children {
        policy: Arc<dyn MeasurePolicy>,
        children: Vec<Element>,
    },
    /// A leaf sized by its measure function.
    Leaf(Arc<dyn MeasureFunction>),
    /// Renders nothing but keeps its position in the tree.
    Nothing,
}

impl Render {
    pub fn children(policy: impl MeasurePolicy + 'static, children: Vec<Element>) -> Self {
        Render::Children {
            policy: Arc::new(policy),
            children,
        }
    }

    pub fn leaf(measure: impl MeasureFunction + 'static) -> Self {
        Render::Leaf(Arc::new(measure))
    }

    /// A leaf that wants `size` and takes whatever the specs allow.
    pub fn fixed(size: Size) -> Self {
        Render::leaf(move |_: &mut MeasureScope<'_>, specs: SizeSpecs| -> Result<Size> {
            Ok(specs.resolve(size))
        })
    }
}

impl fmt::Debug for Render {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Render::Children { children, .. } => f
                .debug_struct("Children")
                .field("children", &children.len())
                .finish(),
            Render::Leaf(_) => f.write_str("Leaf"),
            Render::Nothing => f.write_str("Nothing"),
        }
    }
}

/// Identity of one [`Element`] value. Clones share it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementId(u64);

impl ElementId {
    fn next() -> Self {
        Self(NEXT_ELEMENT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// A component instance placed in the tree, optionally with an explicit key.
///
/// Two elements are the same only when one is a clone of the other; equal
/// props in separately built elements do not count.
#[derive(Clone)]
pub struct Element {
    id: ElementId,
    key: Option<Arc<str>>,
    component: Arc<dyn Component>,
}

impl Element {
    pub fn new(component: impl Component) -> Self {
        Self::from_arc(Arc::new(component))
    }

    pub fn from_arc(component: Arc<dyn Component>) -> Self {
        Self {
            id: ElementId::next(),
            key: None,
            component,
        }
    }

    pub fn keyed(mut self, key: impl Into<Arc<str>>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn id(&self) -> ElementId {
        self.id
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn component(&self) -> &Arc<dyn Component> {
        &self.component
    }

    pub fn type_name(&self) -> &'static str {
        self.component.type_name()
    }

    pub fn same(&self, other: &Element) -> bool {
        self.id == other.id
    }
}

impl<C: Component> From<C> for Element {
    fn from(component: C) -> Self {
        Element::new(component)
    }
}

impl fmt::Debug for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Element")
            .field("id", &self.id.0)
            .field("type", &self.type_name())
            .field("key", &self.key)
            .finish()
    }
}

//! Scoped replacement of the default registry, plugin manager and bus.
//!
//! Defaults resolve through two stacks: a tokio task-local frame set by
//! [`Overrides::scope`] and a thread-local stack pushed by [`Overrides::enter`].
//! Each frame carries a sequence number so the innermost one wins whichever
//! stack it lives on. Neither stack is visible to other tasks or threads, so
//! concurrent invocations never see each other's overrides.

use std::cell::RefCell;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::LazyLock;

use tileable_events::{default_bus, EventBus};

use crate::plugins::PluginManager;
use crate::registry::Registry;

static PROCESS_REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);
static PROCESS_PLUGINS: LazyLock<PluginManager> = LazyLock::new(PluginManager::new);
static NEXT_FRAME: AtomicU64 = AtomicU64::new(1);

/// The registry, plugin manager and bus `invoke` falls back to.
#[derive(Clone, Debug)]
pub struct Defaults {
    pub registry: Registry,
    pub plugins: PluginManager,
    pub event_bus: EventBus,
}

#[derive(Clone)]
struct Frame {
    seq: u64,
    defaults: Defaults,
}

impl Frame {
    fn new(defaults: Defaults) -> Self {
        Self {
            seq: NEXT_FRAME.fetch_add(1, Ordering::SeqCst),
            defaults,
        }
    }
}

tokio::task_local! {
    static TASK_FRAME: Frame;
}

thread_local! {
    static THREAD_STACK: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
}

/// Process-wide registry used when no override is active.
pub fn default_registry() -> Registry {
    PROCESS_REGISTRY.clone()
}

/// Process-wide plugin manager used when no override is active.
pub fn default_plugins() -> PluginManager {
    PROCESS_PLUGINS.clone()
}

/// Process-wide bus used when no override is active.
pub fn default_event_bus() -> EventBus {
    default_bus()
}

/// Defaults visible from the current task or thread.
pub fn current() -> Defaults {
    let task = TASK_FRAME.try_with(|frame| frame.clone()).ok();
    let thread = THREAD_STACK.with(|stack| stack.borrow().last().cloned());

    let innermost = match (task, thread) {
        (Some(t), Some(h)) => Some(if t.seq > h.seq { t } else { h }),
        (t, h) => t.or(h),
    };

    match innermost {
        Some(frame) => frame.defaults,
        None => Defaults {
            registry: default_registry(),
            plugins: default_plugins(),
            event_bus: default_event_bus(),
        },
    }
}

impl Defaults {
    /// Push these defaults onto the calling thread until the guard drops.
    pub fn enter(&self) -> OverrideGuard {
        let depth = THREAD_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            stack.push(Frame::new(self.clone()));
            stack.len() - 1
        });
        OverrideGuard {
            depth,
            _not_send: PhantomData,
        }
    }
}

/// Pops the thread-local frame it pushed, plus anything left above it.
#[must_use = "the override ends as soon as the guard is dropped"]
pub struct OverrideGuard {
    depth: usize,
    _not_send: PhantomData<*const ()>,
}

impl Drop for OverrideGuard {
    fn drop(&mut self) {
        THREAD_STACK.with(|stack| stack.borrow_mut().truncate(self.depth));
    }
}

/// Which defaults to replace. Unset fields inherit from the enclosing scope.
#[derive(Clone, Default, Debug)]
pub struct Overrides {
    registry: Option<Registry>,
    plugins: Option<PluginManager>,
    event_bus: Option<EventBus>,
}

impl Overrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn plugins(mut self, plugins: PluginManager) -> Self {
        self.plugins = Some(plugins);
        self
    }

    pub fn event_bus(mut self, bus: EventBus) -> Self {
        self.event_bus = Some(bus);
        self
    }

    fn resolve(self) -> Defaults {
        let base = current();
        Defaults {
            registry: self.registry.unwrap_or(base.registry),
            plugins: self.plugins.unwrap_or(base.plugins),
            event_bus: self.event_bus.unwrap_or(base.event_bus),
        }
    }

    /// Run `fut` with these overrides. The prior defaults are back in place
    /// once the future completes, fails or is dropped.
    pub async fn scope<F: Future>(self, fut: F) -> F::Output {
        let frame = Frame::new(self.resolve());
        TASK_FRAME.scope(frame, fut).await
    }

    /// Apply the overrides to synchronous code on this thread.
    pub fn enter(self) -> OverrideGuard {
        self.resolve().enter()
    }
}

/// Shorthand for [`Overrides::scope`].
pub async fn with_overrides<F: Future>(overrides: Overrides, fut: F) -> F::Output {
    overrides.scope(fut).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_guards_restore_in_order() {
        let outer = Registry::new();
        let inner = Registry::new();

        let before = current().registry;
        {
            let _outer = Overrides::new().registry(outer.clone()).enter();
            assert!(current().registry.ptr_eq(&outer));
            {
                let _inner = Overrides::new().registry(inner.clone()).enter();
                assert!(current().registry.ptr_eq(&inner));
            }
            assert!(current().registry.ptr_eq(&outer));
        }
        assert!(current().registry.ptr_eq(&before));
    }

    #[test]
    fn unset_fields_inherit_from_enclosing_scope() {
        let bus = EventBus::new();
        let registry = Registry::new();

        let _bus = Overrides::new().event_bus(bus.clone()).enter();
        let _registry = Overrides::new().registry(registry.clone()).enter();

        let defaults = current();
        assert!(defaults.event_bus.ptr_eq(&bus));
        assert!(defaults.registry.ptr_eq(&registry));
    }

    #[tokio::test]
    async fn task_scope_does_not_leak_into_other_tasks() {
        let scoped = Registry::new();
        let probe = scoped.clone();

        let other = tokio::spawn(async move { current().registry.ptr_eq(&probe) });

        let inside = Overrides::new()
            .registry(scoped.clone())
            .scope(async { current().registry.ptr_eq(&scoped) })
            .await;

        assert!(inside);
        assert!(!other.await.unwrap());
        assert!(!current().registry.ptr_eq(&scoped));
    }
}

//! Resource Lifecycle
//!
//! One slot per resource node. A slot creates its instance at most once,
//! hands the same instance to every consumer and gives it back for
//! destruction as soon as its last consumer is released.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use log::debug;
use tokio::sync::OnceCell;

use crate::error::RunError;
use crate::workflow::graph::NodeId;
use crate::workflow::registry::ResourceInstance;

struct Slot {
    kind: String,
    cell: Arc<OnceCell<ResourceInstance>>,
    consumers: BTreeSet<NodeId>,
    destroyed: bool,
}

/// A created instance whose consumers are all done.
#[derive(Clone)]
pub struct Released {
    pub name: String,
    pub kind: String,
    pub instance: ResourceInstance,
}

impl std::fmt::Debug for Released {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Released")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Tracks resource instances and their consumers for one run.
#[derive(Default)]
pub struct ResourceManager {
    slots: Mutex<HashMap<String, Slot>>,
}

impl ResourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Declares a resource and the nodes that will use it.
    pub fn register(
        &self,
        name: impl Into<String>,
        kind: impl Into<String>,
        consumers: impl IntoIterator<Item = NodeId>,
    ) {
        let name = name.into();
        let consumers: BTreeSet<NodeId> = consumers.into_iter().collect();
        debug!("Resource '{}' registered with {} consumers", name, consumers.len());
        self.slots().insert(
            name,
            Slot {
                kind: kind.into(),
                cell: Arc::new(OnceCell::new()),
                consumers,
                destroyed: false,
            },
        );
    }

    /// Adds consumers to a registered resource.
    pub fn add_consumers(&self, name: &str, consumers: impl IntoIterator<Item = NodeId>) {
        if let Some(slot) = self.slots().get_mut(name) {
            slot.consumers.extend(consumers);
        }
    }

    /// Returns the instance, creating it with `create` on first use.
    ///
    /// Concurrent callers wait for the same creation. A failed creation
    /// leaves the slot empty.
    pub async fn acquire<F, Fut>(&self, name: &str, create: F) -> Result<ResourceInstance, RunError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ResourceInstance, RunError>>,
    {
        let cell = self
            .slots()
            .get(name)
            .map(|slot| slot.cell.clone())
            .ok_or_else(|| RunError::ResourceUnavailable(name.to_string()))?;

        let instance = cell.get_or_try_init(create).await?;
        Ok(instance.clone())
    }

    /// Instance of a created resource that has not been destroyed.
    pub fn instance(&self, name: &str) -> Option<ResourceInstance> {
        let slots = self.slots();
        let slot = slots.get(name)?;
        if slot.destroyed {
            return None;
        }
        slot.cell.get().cloned()
    }

    /// Removes `consumer` from every slot.
    ///
    /// Returns the created instances left without consumers. Each is
    /// returned once; the caller destroys it.
    pub fn release(&self, consumer: &NodeId) -> Vec<Released> {
        let mut released = Vec::new();
        for (name, slot) in self.slots().iter_mut() {
            if !slot.consumers.remove(consumer) || !slot.consumers.is_empty() || slot.destroyed {
                continue;
            }
            if let Some(instance) = slot.cell.get() {
                slot.destroyed = true;
                debug!("Resource '{}' released by its last consumer {}", name, consumer);
                released.push(Released {
                    name: name.clone(),
                    kind: slot.kind.clone(),
                    instance: instance.clone(),
                });
            }
        }
        released
    }

    /// Hands back every created instance not yet destroyed.
    pub fn drain_live(&self) -> Vec<Released> {
        let mut released = Vec::new();
        for (name, slot) in self.slots().iter_mut() {
            if slot.destroyed {
                continue;
            }
            if let Some(instance) = slot.cell.get() {
                slot.destroyed = true;
                released.push(Released {
                    name: name.clone(),
                    kind: slot.kind.clone(),
                    instance: instance.clone(),
                });
            }
        }
        released.sort_by(|a, b| a.name.cmp(&b.name));
        released
    }
}

impl std::fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slots = self.slots();
        let mut names: Vec<&String> = slots.keys().collect();
        names.sort();
        f.debug_struct("ResourceManager")
            .field("resources", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn manager() -> ResourceManager {
        let manager = ResourceManager::new();
        manager.register(
            "db",
            "pool",
            [NodeId::step("a"), NodeId::step("b")],
        );
        manager
    }

    #[tokio::test]
    async fn test_acquire_creates_once() {
        let manager = Arc::new(manager());
        let created = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let manager = manager.clone();
            let created = created.clone();
            handles.push(tokio::spawn(async move {
                manager
                    .acquire("db", || async move {
                        created.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(Arc::new(42_u32) as ResourceInstance)
                    })
                    .await
            }));
        }

        let mut instances = Vec::new();
        for handle in handles {
            instances.push(handle.await.unwrap().unwrap());
        }
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert!(instances.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert!(manager.instance("db").is_some());
    }

    #[tokio::test]
    async fn test_failed_creation_leaves_slot_empty() {
        let manager = manager();
        let result = manager
            .acquire("db", || async {
                Err(RunError::Create {
                    source: "refused".into(),
                })
            })
            .await;
        assert!(matches!(result, Err(RunError::Create { .. })));
        assert!(manager.instance("db").is_none());
        assert!(manager.release(&NodeId::step("a")).is_empty());
        assert!(manager.release(&NodeId::step("b")).is_empty());
        assert!(manager.drain_live().is_empty());
    }

    #[tokio::test]
    async fn test_release_after_last_consumer() {
        let manager = manager();
        manager
            .acquire("db", || async { Ok(Arc::new(1_u8) as ResourceInstance) })
            .await
            .unwrap();

        assert!(manager.release(&NodeId::step("a")).is_empty());
        assert!(manager.instance("db").is_some());

        let released = manager.release(&NodeId::step("b"));
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].name, "db");
        assert_eq!(released[0].kind, "pool");
        assert!(manager.instance("db").is_none());
        assert!(manager.drain_live().is_empty());
    }

    #[tokio::test]
    async fn test_added_consumers_keep_resource_alive() {
        let manager = manager();
        manager
            .acquire("db", || async { Ok(Arc::new(1_u8) as ResourceInstance) })
            .await
            .unwrap();

        manager.add_consumers("db", [NodeId::instance("c", 0)]);
        manager.release(&NodeId::step("a"));
        assert!(manager.release(&NodeId::step("b")).is_empty());
        assert_eq!(manager.release(&NodeId::instance("c", 0)).len(), 1);
    }

    #[tokio::test]
    async fn test_drain_live_returns_unreleased() {
        let manager = manager();
        manager
            .acquire("db", || async { Ok(Arc::new(1_u8) as ResourceInstance) })
            .await
            .unwrap();
        assert_eq!(manager.drain_live().len(), 1);
        assert!(manager.drain_live().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_resource() {
        let manager = ResourceManager::new();
        let result = manager
            .acquire("ghost", || async { Ok(Arc::new(()) as ResourceInstance) })
            .await;
        assert!(matches!(result, Err(RunError::ResourceUnavailable(_))));
    }
}

/*!
 * Runtime Bootstrap
 * Builder wiring configuration, address space, threads and dispatch together
 */

use crate::core::config::RuntimeConfig;
use crate::core::errors::RuntimeResult;
use crate::core::latch::ProcessLatch;
use crate::loader::LoadOrderRegistry;
use crate::memory::{AddressSpace, HostMapper, MemoryStats};
use crate::signals::{DispatchCore, DispatchStatsSnapshot, GuestDispatcher};
use crate::thread::{ThreadLauncher, ThreadManager};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Builder for [`Runtime`]
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    dispatcher: Arc<dyn GuestDispatcher>,
    mapper: Option<Arc<dyn HostMapper>>,
    latch: Option<Arc<ProcessLatch>>,
}

impl RuntimeBuilder {
    pub fn new(dispatcher: Arc<dyn GuestDispatcher>) -> Self {
        Self {
            config: RuntimeConfig::default(),
            dispatcher,
            mapper: None,
            latch: None,
        }
    }

    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the host mapping backend
    pub fn with_mapper(mut self, mapper: Arc<dyn HostMapper>) -> Self {
        self.mapper = Some(mapper);
        self
    }

    /// Share an existing exit latch
    pub fn with_latch(mut self, latch: Arc<ProcessLatch>) -> Self {
        self.latch = Some(latch);
        self
    }

    pub fn build(self) -> RuntimeResult<Runtime> {
        let config = self.config;
        let space = Arc::new(match self.mapper {
            Some(mapper) => AddressSpace::with_mapper(mapper, config.thread_capacity)?,
            None => AddressSpace::new(config.thread_capacity)?,
        });
        if config.large_address_aware {
            space.set_large_address_space();
        }

        let latch = self.latch.unwrap_or_else(|| Arc::new(ProcessLatch::new()));
        let threads = Arc::new(ThreadManager::new(space.clone(), latch));
        let dispatch = Arc::new(DispatchCore::new(
            self.dispatcher,
            space.clone(),
            threads.clone(),
            config.xstate_compaction,
        ));
        let launcher: Arc<dyn ThreadLauncher> = dispatch.clone();
        threads.set_launcher(Arc::downgrade(&launcher));

        let load_order = LoadOrderRegistry::new();
        if let Some(app) = config.app_name.as_deref() {
            load_order.set_app_name(app)?;
        }
        if let Some(overrides) = config.dll_overrides.as_deref() {
            let count = load_order.parse_overrides(overrides)?;
            info!(count, "Load-order overrides applied");
        }

        info!(
            threads = config.thread_capacity,
            large_address_aware = config.large_address_aware,
            compaction = config.xstate_compaction,
            "Runtime initialized"
        );
        Ok(Runtime {
            config,
            space,
            threads,
            dispatch,
            load_order,
        })
    }
}

/// Process-wide runtime state
pub struct Runtime {
    config: RuntimeConfig,
    space: Arc<AddressSpace>,
    threads: Arc<ThreadManager>,
    dispatch: Arc<DispatchCore>,
    load_order: LoadOrderRegistry,
}

/// Serializable runtime status
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeStatus {
    pub thread_capacity: usize,
    pub free_thread_slots: usize,
    pub memory: MemoryStats,
    pub dispatch: DispatchStatsSnapshot,
}

impl Runtime {
    pub fn builder(dispatcher: Arc<dyn GuestDispatcher>) -> RuntimeBuilder {
        RuntimeBuilder::new(dispatcher)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn space(&self) -> &Arc<AddressSpace> {
        &self.space
    }

    pub fn threads(&self) -> &Arc<ThreadManager> {
        &self.threads
    }

    pub fn dispatch(&self) -> &Arc<DispatchCore> {
        &self.dispatch
    }

    pub fn load_order(&self) -> &LoadOrderRegistry {
        &self.load_order
    }

    /// Route host traps for the whole process through this runtime
    ///
    /// May be called once per process.
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    pub fn install_host_handlers(&self) -> RuntimeResult<()> {
        crate::signals::host::install(self.dispatch.clone())?;
        Ok(())
    }

    pub fn status(&self) -> RuntimeStatus {
        RuntimeStatus {
            thread_capacity: self.space.tebs().capacity(),
            free_thread_slots: self.space.tebs().available(),
            memory: self.space.stats(),
            dispatch: self.dispatch.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::LoadOrder;
    use crate::signals::dispatcher::MockGuestDispatcher;

    #[test]
    fn test_build_applies_config() {
        let config = RuntimeConfig::default()
            .with_thread_capacity(4)
            .with_large_address_aware(true)
            .with_app_name("game.exe")
            .with_dll_overrides("d3d9=n;msvcrt=b");
        let runtime = Runtime::builder(Arc::new(MockGuestDispatcher::new()))
            .with_config(config)
            .build()
            .unwrap();

        assert!(runtime.space().is_large_address_aware());
        assert_eq!(runtime.load_order().get_load_order("d3d9.dll"), LoadOrder::Native);
        assert_eq!(runtime.load_order().get_load_order("msvcrt"), LoadOrder::Builtin);

        let status = runtime.status();
        assert_eq!(status.thread_capacity, 4);
        assert_eq!(status.free_thread_slots, 4);
        assert_eq!(status.dispatch.traps, 0);
    }
}

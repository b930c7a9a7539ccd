use std::sync::Arc;

use tracing::{info, trace};

use crate::engine::ConsensusEngine;
use crate::task::AutoJoinHandle;

/// Thread driving [`ConsensusEngine::step`]
pub struct StateLoop {
    #[allow(unused)]
    join_handle: AutoJoinHandle,
}

impl StateLoop {
    pub fn new(engine: Arc<ConsensusEngine>) -> Self {
        Self {
            join_handle: AutoJoinHandle::spawn("state-loop", move || {
                let _guard = scopeguard::guard((), |_| {
                    info!("StateLoop is done");
                });
                let panic_guard = engine.panic_guard("state-loop");

                while !engine.is_shutting_down() {
                    let wait = engine.step();
                    if wait.is_zero() {
                        continue;
                    }
                    trace!(wait_ms = wait.as_millis(), "State loop sleeping");
                    engine.wait_for_wake(wait);
                }

                panic_guard.done();
            }),
        }
    }
}

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::ConsensusEngine;
use crate::task::AutoJoinHandle;

/// Thread re-establishing broken peer connections
///
/// Sleeps for the reconnect interval, or until someone reports a lost
/// connection, then retries every active peer still `Connecting`.
pub struct ConnectionKeeper {
    #[allow(unused)]
    join_handle: AutoJoinHandle,
}

impl ConnectionKeeper {
    /// Poll interval while the engine hasn't loaded the membership yet
    const UNINITIALIZED_POLL: Duration = Duration::from_secs(1);

    pub fn new(engine: Arc<ConsensusEngine>) -> Self {
        Self {
            join_handle: AutoJoinHandle::spawn("connection-keeper", move || {
                let _guard = scopeguard::guard((), |_| {
                    info!("ConnectionKeeper is done");
                });
                let panic_guard = engine.panic_guard("connection-keeper");
                let reconnect_interval = engine.config().reconnect_interval;

                while !engine.is_shutting_down() {
                    if !engine.is_initialized() {
                        engine.wait_for_connection_lost(Self::UNINITIALIZED_POLL);
                        continue;
                    }

                    engine.reconnect_peers();
                    engine.wait_for_connection_lost(reconnect_interval);
                }

                panic_guard.done();
            }),
        }
    }
}

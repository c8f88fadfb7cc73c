//! Wiring of one in-process cluster
//!
//! Spawns a partition actor per partition and the deadlock manager, then
//! hands out transactions. Coordinators are spawned per transaction and
//! stop on their own once their handle is dropped.

use crate::config::ClusterConfig;
use crate::error::{Result, RunnerError};
use infini_common::Catalog;
use infini_coordinator::{Coordinator, TransactionHandle};
use infini_deadlock::DeadlockManager;
use infini_partition::PartitionEngine;
use infini_protocol::Network;
use infini_value::{CborCodec, RowCodec};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Handle to a running actor
struct ActorHandle {
    name: String,
    shutdown_tx: Arc<Mutex<Option<oneshot::Sender<()>>>>,
    task: JoinHandle<()>,
}

impl ActorHandle {
    fn signal(&self) {
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }
    }
}

pub struct Cluster {
    config: ClusterConfig,
    network: Network,
    catalog: Arc<Catalog>,
    codec: Arc<dyn RowCodec>,
    actors: Mutex<Vec<ActorHandle>>,
}

impl Cluster {
    /// Start partitions and the deadlock manager; must be called from
    /// within a tokio runtime
    pub fn start(config: ClusterConfig, catalog: Catalog) -> Result<Self> {
        Self::start_with_codec(config, catalog, Arc::new(CborCodec))
    }

    pub fn start_with_codec(config: ClusterConfig, catalog: Catalog, codec: Arc<dyn RowCodec>) -> Result<Self> {
        config.validate()?;
        let network = Network::new(config.partitions);
        let mut actors = Vec::new();

        for id in network.partition_ids() {
            let engine = PartitionEngine::new(id, &catalog, network.clone());
            let mailbox = network.partitions().register(id);
            let (shutdown_tx, shutdown_rx) = oneshot::channel();
            actors.push(ActorHandle {
                name: format!("partition {}", id),
                shutdown_tx: Arc::new(Mutex::new(Some(shutdown_tx))),
                task: tokio::spawn(engine.run(mailbox, shutdown_rx)),
            });
        }

        let manager = DeadlockManager::new(network.clone(), config.deadlock.clone());
        let mailbox = network.deadlock().register(());
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        actors.push(ActorHandle {
            name: "deadlock".into(),
            shutdown_tx: Arc::new(Mutex::new(Some(shutdown_tx))),
            task: tokio::spawn(manager.run(mailbox, shutdown_rx)),
        });

        info!(
            "[cluster] Started {} partitions and the deadlock manager",
            config.partitions
        );

        Ok(Self {
            config,
            network,
            catalog: Arc::new(catalog),
            codec,
            actors: Mutex::new(actors),
        })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn is_running(&self) -> bool {
        !self.actors.lock().is_empty()
    }

    /// Coordinators still registered, finished or not
    pub fn active_transactions(&self) -> usize {
        self.network.coordinators().cleanup();
        self.network.coordinators().len()
    }

    /// Start a transaction on its own coordinator
    pub fn begin(&self) -> Result<TransactionHandle> {
        if !self.is_running() {
            return Err(RunnerError::Stopped);
        }
        let handle = Coordinator::spawn(
            self.network.clone(),
            self.catalog.clone(),
            self.codec.clone(),
            &self.config.coordinator,
        );
        debug!("[cluster] Began txn {}", handle.id().short());
        Ok(handle)
    }

    /// Signal every actor to stop and wait for them
    pub async fn shutdown(&self) {
        let actors = std::mem::take(&mut *self.actors.lock());
        for actor in &actors {
            actor.signal();
        }
        for actor in actors {
            if let Err(e) = actor.task.await {
                debug!("[cluster] {} ended abnormally: {}", actor.name, e);
            }
        }
        info!("[cluster] Shut down");
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        for actor in self.actors.lock().iter() {
            actor.signal();
        }
    }
}

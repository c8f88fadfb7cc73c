//! Deadlock manager actor

use crate::config::DeadlockConfig;
use crate::graph::WaitForGraph;
use infini_common::TransactionId;
use infini_protocol::{CoordinatorEvent, DeadlockAbort, DeadlockChange, DeadlockEvent, Network};
use infini_transport::Mailbox;
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace};

pub struct DeadlockManager {
    network: Network,
    config: DeadlockConfig,
    graph: WaitForGraph,
    aborts: u64,
}

impl DeadlockManager {
    pub fn new(network: Network, config: DeadlockConfig) -> Self {
        Self {
            network,
            config,
            graph: WaitForGraph::new(),
            aborts: 0,
        }
    }

    pub fn graph(&self) -> &WaitForGraph {
        &self.graph
    }

    /// Number of aborts issued so far
    pub fn aborts(&self) -> u64 {
        self.aborts
    }

    /// Apply one event and return the aborts it leads to
    pub fn handle(&mut self, event: DeadlockEvent) -> Vec<DeadlockAbort> {
        match event {
            DeadlockEvent::New {
                transaction,
                pending_cmd_id,
                locked,
                waiting,
            } => {
                debug!(
                    "[deadlock] Tracking txn {} ({} held, {} waited)",
                    transaction.short(),
                    locked.len(),
                    waiting.len()
                );
                self.graph
                    .insert_transaction(transaction, pending_cmd_id, locked, waiting);
                self.resolve_from(transaction)
            }
            DeadlockEvent::Change {
                transaction,
                pending_cmd_id,
                change,
                item,
            } => {
                trace!(
                    "[deadlock] Txn {} {:?} {}",
                    transaction.short(),
                    change,
                    item
                );
                let applied = self
                    .graph
                    .apply_change(transaction, pending_cmd_id, change, item);
                if applied && change == DeadlockChange::AddPending {
                    self.resolve_from(transaction)
                } else {
                    Vec::new()
                }
            }
            DeadlockEvent::Remove { transaction } => {
                if self.graph.remove_transaction(&transaction) {
                    debug!("[deadlock] Released txn {}", transaction.short());
                }
                Vec::new()
            }
            DeadlockEvent::Sweep => self.sweep(),
        }
    }

    /// Walk from every waiting transaction until a full pass finds no cycle
    pub fn sweep(&mut self) -> Vec<DeadlockAbort> {
        let mut aborts = Vec::new();
        loop {
            let mut found = false;
            for transaction in self.graph.waiting_transactions() {
                if !self.graph.contains(&transaction) {
                    continue;
                }
                if let Some(victim) = self.graph.find_cycle(transaction) {
                    aborts.extend(self.abort(victim));
                    found = true;
                }
            }
            if !found {
                return aborts;
            }
        }
    }

    fn resolve_from(&mut self, origin: TransactionId) -> Vec<DeadlockAbort> {
        let mut aborts = Vec::new();
        while let Some(victim) = self.graph.find_cycle(origin) {
            aborts.extend(self.abort(victim));
            if victim == origin {
                break;
            }
        }
        aborts
    }

    /// Pick `victim` and forget it at once, so later walks cannot pick a
    /// second member of the same cycle
    fn abort(&mut self, victim: TransactionId) -> Option<DeadlockAbort> {
        let pending_cmd_id = self.graph.pending_cmd_id(&victim)?;
        self.graph.remove_transaction(&victim);
        self.aborts += 1;
        info!(
            "[deadlock] Cycle closes at txn {}, aborting command {}",
            victim.short(),
            pending_cmd_id
        );
        Some(DeadlockAbort {
            transaction: victim,
            pending_cmd_id,
        })
    }

    fn deliver(&self, abort: DeadlockAbort) {
        if let Err(e) = self
            .network
            .send_to_coordinator(abort.transaction, CoordinatorEvent::Abort(abort))
        {
            debug!(
                "[deadlock] Abort for txn {} not delivered: {}",
                abort.transaction.short(),
                e
            );
        }
    }

    /// Serve events until shutdown is signalled or every sender is gone
    pub async fn run(
        mut self,
        mut mailbox: Mailbox<DeadlockEvent>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        let mut sweep = tokio::time::interval(self.config.sweep_interval());
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            "[deadlock] Started, sweeping every {:?}",
            self.config.sweep_interval()
        );

        loop {
            let aborts = tokio::select! {
                biased;

                _ = &mut shutdown_rx => {
                    info!("[deadlock] Shutdown signal received");
                    break;
                }

                event = mailbox.recv() => match event {
                    Some(event) => self.handle(event),
                    None => {
                        debug!("[deadlock] Mailbox closed");
                        break;
                    }
                },

                _ = sweep.tick() => {
                    if self.graph.is_empty() {
                        continue;
                    }
                    self.sweep()
                }
            };

            for abort in aborts {
                self.deliver(abort);
            }
        }

        info!(
            "[deadlock] Stopped after {} events, {} aborts",
            mailbox.received(),
            self.aborts
        );
    }
}

//! Flush plan generation.
//!
//! Collapses drained write-back messages into durable batches.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use tracing::warn;

use crate::application::repos::BatchOp;
use crate::domain::types::{Relation, RelationKind};

use super::queue::{Epoch, SyncEnvelope};

/// Net relation changes grouped by kind and direction.
#[derive(Debug, Default)]
pub struct FlushPlan {
    pub batches: BTreeMap<(RelationKind, BatchOp), Vec<Relation>>,
    /// Messages superseded by a later message for the same relation.
    pub collapsed: usize,
    /// Messages that did not describe a valid relation.
    pub rejected: usize,
}

impl fmt::Display for FlushPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FlushPlan {{ batches: {}, items: {}, collapsed: {}, rejected: {} }}",
            self.batches.len(),
            self.len(),
            self.collapsed,
            self.rejected
        )
    }
}

impl FlushPlan {
    /// Merge envelopes into a plan.
    ///
    /// - Deduplicates by envelope ID
    /// - Keeps the latest epoch per relation
    /// - Partitions into create/delete batches per kind
    pub fn from_envelopes(envelopes: Vec<SyncEnvelope>) -> Self {
        let mut plan = Self::default();
        let mut seen_ids = HashSet::new();
        let mut latest: HashMap<Relation, (Epoch, bool)> = HashMap::new();

        for envelope in envelopes {
            if !seen_ids.insert(envelope.id) {
                continue;
            }
            let relation = match envelope.message.relation() {
                Ok(relation) => relation,
                Err(err) => {
                    warn!(message_id = %envelope.id, error = %err, "Dropping invalid write-back message");
                    plan.rejected += 1;
                    continue;
                }
            };
            let desired = envelope.message.desired();
            latest
                .entry(relation)
                .and_modify(|(epoch, state)| {
                    plan.collapsed += 1;
                    if envelope.epoch > *epoch {
                        *epoch = envelope.epoch;
                        *state = desired;
                    }
                })
                .or_insert((envelope.epoch, desired));
        }

        for (relation, (_, desired)) in latest {
            plan.batches
                .entry((relation.kind(), BatchOp::from_desired(desired)))
                .or_default()
                .push(relation);
        }
        for relations in plan.batches.values_mut() {
            relations.sort();
        }
        plan
    }

    /// Number of relations across all batches.
    pub fn len(&self) -> usize {
        self.batches.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

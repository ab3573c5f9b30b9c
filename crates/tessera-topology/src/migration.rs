//! Object emigration and immigration.
//!
//! When a reconfiguration moves part of the object space, each leaving
//! (or re-sharded) RM streams its vars to their new homes in fixed-size
//! batches. The receiver persists each element — the var record plus
//! the transaction its frame references — and acknowledges the whole
//! stream with `MigrationComplete`.

use std::collections::HashMap;

use tracing::{debug, warn};

use tessera_store::{Db, Table};
use tessera_types::{Configuration, RMId, Resolver, Topology, VarRecord};
use tessera_wire::{MigrationBatch, MigrationElement};

/// Computes, per destination RM, the batches of vars this node must
/// emigrate under the target configuration.
///
/// A var is emigrated to every RM that hosts it under the target but
/// not under the current topology. Only the var's current frame
/// travels; history is not replayed.
pub fn emigration_batches(
    db: &Db,
    current: &Topology,
    target: &Configuration,
    batch_size: usize,
) -> Result<HashMap<RMId, Vec<MigrationBatch>>, tessera_store::StoreError> {
    let old_resolver = Resolver::new(
        current.config.rms.clone(),
        usize::from(current.two_f_inc),
    );
    let new_resolver = Resolver::new(
        target.rms.clone(),
        usize::from(tessera_types::two_f_inc(target.f)),
    );
    let version = target.version;

    let entries: Vec<(Vec<u8>, Vec<u8>)> = db
        .read(|txn| txn.cursor(Table::Vars).collect())
        .wait()?;

    let mut per_rm: HashMap<RMId, Vec<MigrationElement>> = HashMap::new();
    for (key, value) in entries {
        let Ok(record) = bincode::deserialize::<VarRecord>(&value) else {
            warn!("undecodable var record during emigration; skipping");
            continue;
        };
        debug_assert_eq!(key, record.var.as_bytes().to_vec());

        let Ok(new_homes) = new_resolver.resolve(&record.positions) else {
            continue;
        };
        let old_homes = old_resolver.resolve(&record.positions).unwrap_or_default();

        let txn_key = record.write_txn_id.as_bytes().to_vec();
        let mut txn_bytes: Option<Vec<u8>> = None;
        for rm in new_homes {
            if old_homes.contains(&rm) {
                continue;
            }
            let bytes = match &txn_bytes {
                Some(b) => b.clone(),
                None => {
                    let k = txn_key.clone();
                    match db.read(move |txn| txn.get(Table::Txns, &k)).wait()? {
                        Some(b) => {
                            txn_bytes = Some(b.clone());
                            b
                        }
                        None => {
                            warn!(var = %record.var, "frame txn missing during emigration");
                            break;
                        }
                    }
                }
            };
            let Ok(txn) = bincode::deserialize(&bytes) else {
                continue;
            };
            per_rm.entry(rm).or_default().push(MigrationElement {
                record: record.clone(),
                txn,
            });
        }
    }

    let mut batches = HashMap::new();
    for (rm, elements) in per_rm {
        let chunks: Vec<MigrationBatch> = elements
            .chunks(batch_size)
            .map(|chunk| MigrationBatch {
                version,
                elements: chunk.to_vec(),
            })
            .collect();
        debug!(to = %rm, batches = chunks.len(), "emigration prepared");
        batches.insert(rm, chunks);
    }
    Ok(batches)
}

/// Persists one received migration batch.
///
/// Each element lands atomically (txn blob + var record); a var we
/// already hold at the same or newer version is left alone.
pub fn immigrate(db: &Db, batch: MigrationBatch) -> Result<usize, tessera_store::StoreError> {
    let mut installed = 0;
    for element in batch.elements {
        let var = element.record.var;
        let var_key = var.as_bytes().to_vec();
        let txn_key = element.record.write_txn_id.as_bytes().to_vec();
        let record_bytes =
            bincode::serialize(&element.record).expect("var record serializes");
        let txn_bytes = bincode::serialize(&element.txn).expect("txn serializes");
        let incoming_version = element.record.writes_clock.at(&var);

        let wrote = db
            .read_write(move |txn| {
                if let Some(existing) = txn.get(Table::Vars, &var_key) {
                    if let Ok(existing) = bincode::deserialize::<VarRecord>(&existing) {
                        if existing.writes_clock.at(&existing.var) >= incoming_version {
                            return false;
                        }
                    }
                }
                txn.put(Table::Txns, &txn_key, &txn_bytes);
                txn.put(Table::Vars, &var_key, &record_bytes);
                true
            })
            .wait()?;
        if wrote {
            installed += 1;
        }
    }
    Ok(installed)
}

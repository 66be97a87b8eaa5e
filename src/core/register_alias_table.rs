use crate::core::Clocked;
use crate::instructions::{Fid, RegisterType};

/// One entry of the register alias table. Entries correspond 1:1 to
/// physical registers; `prf` is the entry's own index and never changes.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RatEntry {
    pub(crate) fid: Option<Fid>,
    // on-flight under an unresolved speculative group
    pub(crate) fv: bool,
    // not reallocatable: set when the entry is allocated, cleared on release
    pub(crate) nra: bool,
    pub(crate) prf: RegisterType,
    pub(crate) arf: RegisterType,
    pub(crate) valid: bool,
}

#[derive(Clone, Copy, PartialEq, Debug)]
enum CheckpointOp {
    Snapshot(usize),
    Rollback(usize),
}

/// The register alias table. Maps architectural registers to physical
/// registers for the renaming process. All mutations are staged as
/// `(index, full-entry-copy)` modifications and applied in list order at
/// the commit point; later modifications to the same index override
/// earlier ones, register-write-style. A small array of global checkpoints
/// saves and restores the validity bit vector for misprediction recovery.
pub(crate) struct Rat {
    entries: Vec<RatEntry>,
    modifications: Vec<(usize, RatEntry)>,
    checkpoints: Vec<Vec<bool>>,
    pending_checkpoint: Option<CheckpointOp>,
}

impl Rat {
    pub(crate) fn new(phys_reg_count: u16, checkpoint_count: usize) -> Rat {
        let mut entries = Vec::with_capacity(phys_reg_count as usize);
        for i in 0..phys_reg_count {
            entries.push(RatEntry {
                fid: None,
                fv: false,
                nra: false,
                prf: i,
                arf: 0,
                valid: false,
            });
        }

        Rat {
            entries,
            modifications: Vec::new(),
            checkpoints: vec![vec![false; phys_reg_count as usize]; checkpoint_count],
            pending_checkpoint: None,
        }
    }

    pub(crate) fn entry(&self, prf: RegisterType) -> &RatEntry {
        &self.entries[prf as usize]
    }

    pub(crate) fn entry_count(&self) -> u16 {
        self.entries.len() as u16
    }

    /// Scans the live mappings and returns the physical register the
    /// architectural register currently maps to, first match.
    pub(crate) fn lookup(&self, arf: RegisterType) -> Option<RegisterType> {
        self.entries
            .iter()
            .find(|e| e.valid && e.arf == arf)
            .map(|e| e.prf)
    }

    /// Renames `arf` to a free physical register, staging the invalidation
    /// of any prior live mapping and the activation of the new one. Fails
    /// with `None` when no entry is free; the caller retries next cycle.
    ///
    /// A speculative rename allocates only entries with no live mapping
    /// and pins the displaced entry (`nra` set): an entry whose validity
    /// bit may be restored by a rollback must keep its tag until the
    /// displacing instruction retires and sweeps it via `release`. A
    /// non-speculative rename leaves the displaced entry's `nra` as it is;
    /// reclamation happens at retirement either way.
    pub(crate) fn rename(&mut self, fid: Fid, arf: RegisterType, speculative: bool) -> Option<RegisterType> {
        let free = if speculative {
            self.entries.iter().position(|e| !e.nra && !e.valid)?
        } else {
            self.entries.iter().position(|e| !e.nra)?
        };

        // Only the first live match is invalidated here; release() clears
        // every match. A stale invalidated mapping and a fresh mapping may
        // briefly coexist until the fresh one retires.
        if let Some(prev) = self.entries.iter().position(|e| e.valid && e.arf == arf) {
            let mut displaced = self.entries[prev];
            displaced.valid = false;
            if speculative {
                displaced.nra = true;
            }
            self.modifications.push((prev, displaced));
        }

        let mut entry = self.entries[free];
        entry.fid = Some(fid);
        entry.fv = speculative;
        entry.nra = true;
        entry.arf = arf;
        entry.valid = true;
        self.modifications.push((free, entry));

        Some(entry.prf)
    }

    /// The invalidate-and-release rename: the displaced mapping is freed
    /// immediately instead of waiting for retirement. Only sound when the
    /// displaced entry's producer has drained, so the cycle loop never
    /// uses it; it exists for driving the table at a quiesced boundary.
    pub(crate) fn rename_releasing(&mut self, fid: Fid, arf: RegisterType) -> Option<RegisterType> {
        let free = self.entries.iter().position(|e| !e.nra)?;

        if let Some(prev) = self.entries.iter().position(|e| e.valid && e.arf == arf) {
            let mut displaced = self.entries[prev];
            displaced.valid = false;
            displaced.nra = false;
            self.modifications.push((prev, displaced));
        }

        let mut entry = self.entries[free];
        entry.fid = Some(fid);
        entry.fv = false;
        entry.nra = true;
        entry.arf = arf;
        entry.valid = true;
        self.modifications.push((free, entry));

        Some(entry.prf)
    }

    /// Clears `nra` on every entry currently tagged with `arf`, live or
    /// stale. Multiple matches are intentional.
    pub(crate) fn release(&mut self, arf: RegisterType) {
        for i in 0..self.entries.len() {
            if self.entries[i].arf == arf {
                let mut entry = self.entries[i];
                entry.nra = false;
                entry.fv = false;
                self.modifications.push((i, entry));
            }
        }
    }

    /// Releases a single entry by physical index; used when backtracking
    /// abandoned speculative acquisitions.
    pub(crate) fn release_entry(&mut self, prf: RegisterType) {
        let mut entry = self.entries[prf as usize];
        entry.nra = false;
        entry.fv = false;
        entry.fid = None;
        self.modifications.push((prf as usize, entry));
    }

    /// Clears the speculative flag of one entry; used when the group the
    /// entry was acquired under commits.
    pub(crate) fn clear_fv(&mut self, prf: RegisterType) {
        let mut entry = self.entries[prf as usize];
        entry.fv = false;
        self.modifications.push((prf as usize, entry));
    }

    pub(crate) fn snapshot(&mut self, gc: usize) {
        assert!(
            self.pending_checkpoint.is_none(),
            "RAT: snapshot({}) staged while {:?} is already pending this cycle",
            gc,
            self.pending_checkpoint
        );
        self.pending_checkpoint = Some(CheckpointOp::Snapshot(gc));
    }

    pub(crate) fn rollback(&mut self, gc: usize) {
        assert!(
            self.pending_checkpoint.is_none(),
            "RAT: rollback({}) staged while {:?} is already pending this cycle",
            gc,
            self.pending_checkpoint
        );
        self.pending_checkpoint = Some(CheckpointOp::Rollback(gc));
    }

    pub(crate) fn checkpoint(&self, gc: usize) -> &[bool] {
        &self.checkpoints[gc]
    }

    pub(crate) fn dump(&self) {
        for e in &self.entries {
            if e.valid || e.nra {
                println!(
                    "  RAT[{}] arf={} valid={} nra={} fv={} fid={:?}",
                    e.prf, e.arf, e.valid, e.nra, e.fv, e.fid
                );
            }
        }
    }
}

impl Clocked for Rat {
    fn commit(&mut self) {
        for (index, entry) in self.modifications.drain(..) {
            self.entries[index] = entry;
        }

        // The checkpoint operation applies after the entry modifications:
        // a snapshot records the cycle's final validity vector, a rollback
        // overrides it. Only the validity bits are saved and restored;
        // invalid entries keep their stale tags until reallocated, which is
        // safe because lookups are gated on `valid`.
        match self.pending_checkpoint.take() {
            Some(CheckpointOp::Snapshot(gc)) => {
                for (i, e) in self.entries.iter().enumerate() {
                    self.checkpoints[gc][i] = e.valid;
                }
            }
            Some(CheckpointOp::Rollback(gc)) => {
                for (i, e) in self.entries.iter_mut().enumerate() {
                    e.valid = self.checkpoints[gc][i];
                }
            }
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rename_allocates_distinct_entries() {
        let mut rat = Rat::new(4, 1);

        let p = rat.rename(1, 5, false).unwrap();
        rat.commit();
        let q = rat.rename(2, 5, false).unwrap();
        rat.commit();

        assert_ne!(p, q);
        assert_eq!(rat.lookup(5), Some(q));

        rat.release(5);
        rat.commit();
        assert!(!rat.entry(q).nra);

        // after the release the entry can be handed out again
        let r = rat.rename(3, 6, false).unwrap();
        rat.commit();
        assert_eq!(r, p.min(q));
    }

    #[test]
    fn test_rename_fails_when_table_full() {
        let mut rat = Rat::new(2, 1);
        assert!(rat.rename(1, 0, true).is_some());
        rat.commit();
        assert!(rat.rename(2, 1, true).is_some());
        rat.commit();
        assert!(rat.rename(3, 2, true).is_none());
    }

    #[test]
    fn test_speculative_rename_keeps_displaced_entry_allocated() {
        let mut rat = Rat::new(4, 1);
        let p = rat.rename(1, 7, true).unwrap();
        rat.commit();
        let q = rat.rename(2, 7, true).unwrap();
        rat.commit();

        assert_ne!(p, q);
        assert!(!rat.entry(p).valid);
        assert!(rat.entry(p).nra);
        assert!(rat.entry(q).fv);
    }

    #[test]
    fn test_releasing_rename_frees_displaced_entry() {
        let mut rat = Rat::new(4, 1);
        let p = rat.rename_releasing(1, 7).unwrap();
        rat.commit();
        let _q = rat.rename_releasing(2, 7).unwrap();
        rat.commit();

        assert!(!rat.entry(p).valid);
        assert!(!rat.entry(p).nra);
    }

    #[test]
    fn test_speculative_rename_pins_released_home() {
        let mut rat = Rat::new(4, 1);
        let p = rat.rename(1, 3, false).unwrap();
        rat.commit();
        rat.release(3);
        rat.commit();
        // a committed home: live mapping, reallocatable
        assert!(!rat.entry(p).nra);
        assert!(rat.entry(p).valid);

        let q = rat.rename(2, 3, true).unwrap();
        rat.commit();
        // the speculative rename picked an unmapped entry and re-pinned
        // the home it displaced
        assert_ne!(q, p);
        assert!(!rat.entry(p).valid);
        assert!(rat.entry(p).nra);
        assert_eq!(rat.lookup(3), Some(q));
    }

    #[test]
    fn test_release_clears_all_matching_entries() {
        let mut rat = Rat::new(4, 1);
        let p = rat.rename(1, 3, true).unwrap();
        rat.commit();
        let q = rat.rename(2, 3, true).unwrap();
        rat.commit();

        // stale invalidated mapping and fresh mapping coexist on arf 3
        rat.release(3);
        rat.commit();
        assert!(!rat.entry(p).nra);
        assert!(!rat.entry(q).nra);
    }

    #[test]
    fn test_mutations_are_staged_until_commit() {
        let mut rat = Rat::new(4, 1);
        let p = rat.rename(1, 0, false).unwrap();
        assert_eq!(rat.lookup(0), None);
        assert!(!rat.entry(p).nra);

        rat.commit();
        assert_eq!(rat.lookup(0), Some(p));
    }

    #[test]
    fn test_snapshot_rollback_roundtrip() {
        let mut rat = Rat::new(4, 2);
        rat.rename(1, 0, false).unwrap();
        rat.commit();
        rat.rename(2, 1, false).unwrap();
        rat.snapshot(0);
        rat.commit();

        let saved: Vec<bool> = (0..4).map(|i| rat.entry(i).valid).collect();
        assert_eq!(rat.checkpoint(0), saved.as_slice());

        rat.rename(3, 2, true).unwrap();
        rat.commit();
        let p2 = rat.lookup(2).unwrap();
        assert!(rat.entry(p2).valid);

        rat.rollback(0);
        rat.commit();
        let restored: Vec<bool> = (0..4).map(|i| rat.entry(i).valid).collect();
        assert_eq!(saved, restored);
        assert_eq!(rat.lookup(2), None);
    }

    #[test]
    #[should_panic(expected = "already pending")]
    fn test_snapshot_and_rollback_same_cycle_is_fatal() {
        let mut rat = Rat::new(4, 2);
        rat.snapshot(0);
        rat.rollback(1);
    }

    #[test]
    fn test_later_modification_overrides_earlier() {
        let mut rat = Rat::new(4, 1);
        let p = rat.rename(1, 0, false).unwrap();
        // staged after the rename; its full-entry copy (taken from the
        // committed state) wins wholesale at the commit point
        rat.release_entry(p);
        rat.commit();
        assert!(!rat.entry(p).nra);
        assert!(!rat.entry(p).valid);
    }
}

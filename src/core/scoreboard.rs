use crate::core::Clocked;
use crate::instructions::{Fgr, Fid, RegisterType};

#[derive(Clone, Copy, PartialEq, Debug)]
pub(crate) enum RegStatus {
    // a producer is in flight; the value does not exist yet
    BUSY,
    // the value sits in the reorder buffer entry of the producing fid
    IN_ROB,
    // the value is architecturally committed
    IN_ARCH_FILE,
}

/// Readiness and ownership state of one register slot (a physical register
/// in the out-of-order pipeline, an architectural register in the
/// reference pipeline).
#[derive(Clone, Copy, Debug)]
pub(crate) struct ScoreboardEntry {
    pub(crate) status: RegStatus,
    pub(crate) fid: Fid,
    pub(crate) group_valid: bool,
    pub(crate) fgr: Fgr,
}

/// How a staged status write treats the speculative-group tag.
#[derive(Clone, Copy, Debug)]
pub(crate) enum GroupTag {
    Keep,
    Clear,
    Tag(Fgr),
}

enum StagedOp {
    SetStatus {
        index: RegisterType,
        status: RegStatus,
        fid: Fid,
        group: GroupTag,
    },
    ReleaseGroup(Fgr),
    RestoreGroup(Fgr),
}

/// Per-register readiness tracker gating instruction issue. All mutations
/// are staged and applied in staging order at the commit point.
pub(crate) struct Scoreboard {
    entries: Vec<ScoreboardEntry>,
    staged: Vec<StagedOp>,
}

impl Scoreboard {
    pub(crate) fn new(count: u16) -> Scoreboard {
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            entries.push(ScoreboardEntry {
                status: RegStatus::IN_ARCH_FILE,
                fid: 0,
                group_valid: false,
                fgr: 0,
            });
        }

        Scoreboard {
            entries,
            staged: Vec::new(),
        }
    }

    pub(crate) fn get(&self, index: RegisterType) -> &ScoreboardEntry {
        &self.entries[index as usize]
    }

    pub(crate) fn is_busy(&self, index: RegisterType) -> bool {
        self.entries[index as usize].status == RegStatus::BUSY
    }

    pub(crate) fn set_status(&mut self, index: RegisterType, status: RegStatus, fid: Fid, group: GroupTag) {
        debug_assert!((index as usize) < self.entries.len(), "scoreboard index {} out of range", index);
        self.staged.push(StagedOp::SetStatus { index, status, fid, group });
    }

    /// Clears the speculative-group flag of every entry tagged with `fgr`;
    /// used when the group commits.
    pub(crate) fn release_group(&mut self, fgr: Fgr) {
        self.staged.push(StagedOp::ReleaseGroup(fgr));
    }

    /// Clears the flag and forces the status back to IN_ARCH_FILE for every
    /// entry tagged with `fgr`; used when the group is abandoned.
    pub(crate) fn restore_group(&mut self, fgr: Fgr) {
        self.staged.push(StagedOp::RestoreGroup(fgr));
    }

    pub(crate) fn dump(&self) {
        for (i, e) in self.entries.iter().enumerate() {
            if e.status != RegStatus::IN_ARCH_FILE || e.group_valid {
                println!(
                    "  scoreboard[{}] {:?} fid={} group_valid={} fgr={}",
                    i, e.status, e.fid, e.group_valid, e.fgr
                );
            }
        }
    }
}

impl Clocked for Scoreboard {
    fn commit(&mut self) {
        for op in self.staged.drain(..) {
            match op {
                StagedOp::SetStatus { index, status, fid, group } => {
                    let entry = &mut self.entries[index as usize];
                    entry.status = status;
                    entry.fid = fid;
                    match group {
                        GroupTag::Keep => {}
                        GroupTag::Clear => entry.group_valid = false,
                        GroupTag::Tag(fgr) => {
                            entry.group_valid = true;
                            entry.fgr = fgr;
                        }
                    }
                }
                StagedOp::ReleaseGroup(fgr) => {
                    for entry in &mut self.entries {
                        if entry.group_valid && entry.fgr == fgr {
                            entry.group_valid = false;
                        }
                    }
                }
                StagedOp::RestoreGroup(fgr) => {
                    for entry in &mut self.entries {
                        if entry.group_valid && entry.fgr == fgr {
                            entry.group_valid = false;
                            entry.status = RegStatus::IN_ARCH_FILE;
                        }
                    }
                }
            }
        }
    }
}

//! Transfer phases and their filter rules.
//!
//! Phases run in declaration order. References always land before the
//! objects they point at could be pruned, so a repository in the snapshot
//! never names an object that was not copied.

use std::fmt;

/// One rsync filter rule. Order matters: the first matching rule wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterRule {
    Include(&'static str),
    Exclude(&'static str),
}

impl fmt::Display for FilterRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterRule::Include(pattern) => write!(f, "+ {pattern}"),
            FilterRule::Exclude(pattern) => write!(f, "- {pattern}"),
        }
    }
}

use FilterRule::{Exclude, Include};

/// Applied ahead of every phase: the quiescence marker, cache-only and
/// deprecated trees, git lock files and half-written temporaries.
const COMMON_EXCLUDES: &[FilterRule] = &[
    Exclude("/.sync_in_progress"),
    Exclude("/__nodeload_archives__/"),
    Exclude("/__gitmon__/"),
    Exclude("tmp_*"),
    Exclude("*.lock"),
];

const AUXILIARY: &[FilterRule] = &[
    Exclude("/__special__/"),
    Exclude("/info/"),
    Exclude("**.git/objects/"),
    Exclude("**.git/refs/"),
    Exclude("**.git/logs/"),
    Exclude("**.git/packed-refs"),
    Include("*/"),
    Include("*"),
];

const PACKED_REFS: &[FilterRule] = &[
    Exclude("/__special__/"),
    Exclude("/info/"),
    Exclude("**.git/objects/"),
    Include("*/"),
    Include("**.git/packed-refs"),
    Exclude("*"),
];

const LOOSE_REFS_AND_LOGS: &[FilterRule] = &[
    Exclude("/__special__/"),
    Exclude("/info/"),
    Exclude("**.git/objects/"),
    Include("*/"),
    Include("**.git/refs/**"),
    Include("**.git/logs/**"),
    Exclude("*"),
];

const OBJECTS_AND_PACKS: &[FilterRule] = &[
    Exclude("/__special__/"),
    Exclude("/info/"),
    Include("*/"),
    Include("**.git/objects/**"),
    Exclude("*"),
];

const SPECIAL_DIRS: &[FilterRule] = &[
    Include("/__special__/"),
    Include("/__special__/**"),
    Include("/info/"),
    Include("/info/**"),
    Exclude("*"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransferPhase {
    Auxiliary,
    PackedRefs,
    LooseRefsAndLogs,
    ObjectsAndPacks,
    SpecialDirs,
}

impl TransferPhase {
    pub const ALL: [TransferPhase; 5] = [
        TransferPhase::Auxiliary,
        TransferPhase::PackedRefs,
        TransferPhase::LooseRefsAndLogs,
        TransferPhase::ObjectsAndPacks,
        TransferPhase::SpecialDirs,
    ];

    pub fn name(self) -> &'static str {
        match self {
            TransferPhase::Auxiliary => "auxiliary",
            TransferPhase::PackedRefs => "packed-refs",
            TransferPhase::LooseRefsAndLogs => "refs-and-logs",
            TransferPhase::ObjectsAndPacks => "objects-and-packs",
            TransferPhase::SpecialDirs => "special-dirs",
        }
    }

    /// Full ordered rule list for this phase.
    pub fn rules(self) -> Vec<FilterRule> {
        let specific = match self {
            TransferPhase::Auxiliary => AUXILIARY,
            TransferPhase::PackedRefs => PACKED_REFS,
            TransferPhase::LooseRefsAndLogs => LOOSE_REFS_AND_LOGS,
            TransferPhase::ObjectsAndPacks => OBJECTS_AND_PACKS,
            TransferPhase::SpecialDirs => SPECIAL_DIRS,
        };
        COMMON_EXCLUDES.iter().chain(specific).copied().collect()
    }

    /// Objects and packs are zlib-compressed already.
    pub fn compress(self) -> bool {
        self != TransferPhase::ObjectsAndPacks
    }

    /// Object storage is deduplicated across forks with hard links.
    pub fn hard_links(self) -> bool {
        self == TransferPhase::ObjectsAndPacks
    }
}

impl fmt::Display for TransferPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
